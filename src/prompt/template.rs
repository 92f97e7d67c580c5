//! Chat prompt templating

use anyhow::Result;

use super::ChatMessage;

/// Renders a message list into model prompt text.
///
/// Rendering must be prefix-stable: rendering `messages[..n]` without the
/// generation prompt yields a prefix of rendering the full list. The caches
/// rely on this to split a prompt into a cached and an uncached part.
pub trait ChatTemplate: Send + Sync {
    fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String>;
}

/// `<|role|>` framed template.
#[derive(Debug, Default, Clone)]
pub struct DefaultTemplate;

impl ChatTemplate for DefaultTemplate {
    fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        let mut prompt = String::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" | "user" | "assistant" | "tool" => {
                    prompt.push_str(&format!("<|{}|>\n{}\n", msg.role, msg.content));
                }
                _ => {
                    prompt.push_str(&format!("{}: {}\n", msg.role, msg.content));
                }
            }
        }

        if add_generation_prompt {
            prompt.push_str("<|assistant|>");
        }
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_roles_and_generation_prompt() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
            ChatMessage::new("critic", "meh"),
        ];
        let text = DefaultTemplate.render(&messages, true).unwrap();
        assert_eq!(
            text,
            "<|system|>\nbe brief\n<|user|>\nhi\ncritic: meh\n<|assistant|>"
        );
    }

    #[test]
    fn rendering_is_prefix_stable() {
        let messages = vec![
            ChatMessage::user("one"),
            ChatMessage::assistant("two"),
            ChatMessage::user("three"),
        ];
        let full = DefaultTemplate.render(&messages, true).unwrap();
        for n in 0..messages.len() {
            let prefix = DefaultTemplate.render(&messages[..n], false).unwrap();
            assert!(full.starts_with(&prefix));
        }
    }
}
