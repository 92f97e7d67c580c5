//! Section classification of streamed text
//!
//! Splits decoded text into completion, reasoning and tool-call sections by
//! scanning for the output markers of the model family. A marker may arrive
//! split over several tokens, so any tail that could still grow into a
//! marker is held back until the next push resolves it.

use serde_json::Value;
use tracing::warn;

use super::chunk::ToolCall;
use crate::config::ModelFamily;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";
const TOOL_OPEN: &str = "<tool_call>";
const TOOL_CLOSE: &str = "</tool_call>";

const CHANNEL: &str = "<|channel|>";
const MESSAGE: &str = "<|message|>";
const START: &str = "<|start|>";
const END: &str = "<|end|>";
const CALL: &str = "<|call|>";
const RETURN: &str = "<|return|>";

const HARMONY_MARKERS: &[&str] = &[CHANNEL, MESSAGE, START, END, CALL, RETURN];

/// Kind of content a piece of output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Completion,
    Reasoning,
    ToolCall,
}

/// Classified output.
#[derive(Debug, Clone, PartialEq)]
pub enum Piece {
    Text { section: Section, text: String },
    ToolCall(ToolCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Completion,
    Reasoning,
    ToolCall,
    /// Harmony message header, between `<|start|>`/`<|channel|>` and `<|message|>`
    Header,
}

#[derive(Debug)]
pub struct Classifier {
    family: ModelFamily,
    state: State,
    pending: String,
    capture: String,
    tool_name: Option<String>,
    trim_leading: bool,
}

impl Classifier {
    pub fn new(family: ModelFamily) -> Self {
        Self {
            family,
            state: State::Completion,
            pending: String::new(),
            capture: String::new(),
            tool_name: None,
            trim_leading: false,
        }
    }

    /// Section the classifier is currently in.
    pub fn section(&self) -> Section {
        match self.state {
            State::Reasoning => Section::Reasoning,
            State::ToolCall => Section::ToolCall,
            State::Completion | State::Header => Section::Completion,
        }
    }

    /// Classify the next run of decoded text.
    pub fn push(&mut self, text: &str) -> Vec<Piece> {
        self.pending.push_str(text);
        let mut pieces = Vec::new();

        loop {
            let markers = self.active_markers();
            let found = markers
                .iter()
                .filter_map(|m| self.pending.find(m).map(|at| (at, *m)))
                .min_by_key(|(at, _)| *at);

            match found {
                Some((at, marker)) => {
                    let before = self.pending[..at].to_string();
                    self.pending.drain(..at + marker.len());
                    self.emit(&before, &mut pieces);
                    self.on_marker(marker, &mut pieces);
                }
                None => {
                    let keep = partial_marker_len(&self.pending, markers);
                    let ready: String = self.pending.drain(..self.pending.len() - keep).collect();
                    self.emit(&ready, &mut pieces);
                    break;
                }
            }
        }
        pieces
    }

    /// Flush held-back text and close any open tool call.
    pub fn finish(&mut self) -> Vec<Piece> {
        let mut pieces = Vec::new();
        let rest = std::mem::take(&mut self.pending);
        self.emit(&rest, &mut pieces);
        match self.state {
            State::ToolCall => self.close_tool_call(&mut pieces),
            State::Header => self.capture.clear(),
            _ => {}
        }
        self.state = State::Completion;
        pieces
    }

    fn active_markers(&self) -> &'static [&'static str] {
        match (self.family, self.state) {
            (ModelFamily::Harmony, _) => HARMONY_MARKERS,
            (ModelFamily::Standard, State::Reasoning) => &[THINK_CLOSE],
            (ModelFamily::Standard, State::ToolCall) => &[TOOL_CLOSE],
            (ModelFamily::Standard, _) => &[THINK_OPEN, TOOL_OPEN],
        }
    }

    fn emit(&mut self, text: &str, pieces: &mut Vec<Piece>) {
        let section = match self.state {
            State::Completion => Section::Completion,
            State::Reasoning => Section::Reasoning,
            State::ToolCall | State::Header => {
                self.capture.push_str(text);
                return;
            }
        };

        let text = if self.trim_leading {
            text.trim_start_matches(['\n', '\r'])
        } else {
            text
        };
        if text.is_empty() {
            return;
        }
        self.trim_leading = false;

        match pieces.last_mut() {
            Some(Piece::Text { section: s, text: t }) if *s == section => t.push_str(text),
            _ => pieces.push(Piece::Text {
                section,
                text: text.to_string(),
            }),
        }
    }

    fn switch(&mut self, state: State) {
        self.state = state;
        self.trim_leading = matches!(state, State::Completion | State::Reasoning);
    }

    fn on_marker(&mut self, marker: &str, pieces: &mut Vec<Piece>) {
        match marker {
            THINK_OPEN => self.switch(State::Reasoning),
            THINK_CLOSE => self.switch(State::Completion),
            TOOL_OPEN => {
                self.capture.clear();
                self.tool_name = None;
                self.switch(State::ToolCall);
            }
            TOOL_CLOSE | CALL => {
                if self.state == State::ToolCall {
                    self.close_tool_call(pieces);
                }
                self.switch(State::Completion);
            }
            START | CHANNEL => {
                if self.state == State::ToolCall {
                    self.close_tool_call(pieces);
                }
                self.capture.clear();
                self.state = State::Header;
            }
            MESSAGE => {
                if self.state == State::Header {
                    let header = std::mem::take(&mut self.capture);
                    self.open_channel(&header);
                }
            }
            END | RETURN => {
                if self.state == State::ToolCall {
                    self.close_tool_call(pieces);
                }
                if self.state != State::Completion {
                    self.switch(State::Completion);
                }
            }
            _ => {}
        }
    }

    /// Pick the section a harmony message body belongs to from its header,
    /// e.g. `analysis`, `final` or `commentary to=functions.lookup`.
    fn open_channel(&mut self, header: &str) {
        let header = header.trim();
        if let Some(at) = header.find("to=functions.") {
            let name: String = header[at + "to=functions.".len()..]
                .chars()
                .take_while(|c| !c.is_whitespace() && *c != '<')
                .collect();
            self.tool_name = Some(name);
            self.capture.clear();
            self.state = State::ToolCall;
        } else if header.starts_with("analysis") {
            self.switch(State::Reasoning);
        } else {
            self.switch(State::Completion);
        }
    }

    fn close_tool_call(&mut self, pieces: &mut Vec<Piece>) {
        let body = std::mem::take(&mut self.capture);
        let call = match self.tool_name.take() {
            Some(name) => Some(ToolCall::new(name, body.trim().to_string())),
            None => parse_tool_call(&body),
        };
        match call {
            Some(call) => pieces.push(Piece::ToolCall(call)),
            None => {
                warn!(body = %body, "unparseable tool call, emitting as text");
                self.state = State::Completion;
                self.trim_leading = false;
                self.emit(&body, pieces);
            }
        }
    }
}

/// `{"name": ..., "arguments": ...}` body of a `<tool_call>` section.
fn parse_tool_call(body: &str) -> Option<ToolCall> {
    let value: Value = serde_json::from_str(body.trim()).ok()?;
    let name = value.get("name")?.as_str()?.to_string();
    let arguments = match value.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_string(),
    };
    Some(ToolCall::new(name, arguments))
}

/// Length of the longest suffix of `text` that is a proper prefix of a marker.
fn partial_marker_len(text: &str, markers: &[&str]) -> usize {
    let longest = markers.iter().map(|m| m.len() - 1).max().unwrap_or(0);
    for keep in (1..=longest.min(text.len())).rev() {
        let start = text.len() - keep;
        if !text.is_char_boundary(start) {
            continue;
        }
        let tail = &text[start..];
        if markers.iter().any(|m| m.len() > keep && m.starts_with(tail)) {
            return keep;
        }
    }
    0
}
