//! Turns raw agent stdout into agent chat messages, one per meaningful line.

use crate::message::Message;

/// Lines containing this marker are agent diagnostics, not chat output.
pub const DEBUG_NOISE_MARKER: &str = "[DEBUG]";

/// How a line that straddles two output chunks is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineMode {
    /// Each chunk is split on its own; a straddling line becomes two messages.
    #[default]
    PerChunk,
    /// The trailing partial line is held until the next chunk or `flush`.
    Buffered,
}

impl LineMode {
    pub fn from_carry_partial_lines(carry: bool) -> Self {
        if carry {
            Self::Buffered
        } else {
            Self::PerChunk
        }
    }
}

#[derive(Debug, Default)]
pub struct OutputLineParser {
    mode: LineMode,
    carry: String,
}

impl OutputLineParser {
    pub fn new(mode: LineMode) -> Self {
        Self {
            mode,
            carry: String::new(),
        }
    }

    pub fn mode(&self) -> LineMode {
        self.mode
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Message> {
        match self.mode {
            LineMode::PerChunk => messages_from(chunk),
            LineMode::Buffered => {
                self.carry.push_str(chunk);
                let Some(end) = self.carry.rfind('\n') else {
                    return Vec::new();
                };
                let rest = self.carry.split_off(end + 1);
                let complete = std::mem::replace(&mut self.carry, rest);
                messages_from(&complete)
            }
        }
    }

    /// Emits any held partial line, e.g. once the process has exited.
    pub fn flush(&mut self) -> Vec<Message> {
        let rest = std::mem::take(&mut self.carry);
        messages_from(&rest)
    }
}

fn messages_from(text: &str) -> Vec<Message> {
    text.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains(DEBUG_NOISE_MARKER))
        .map(Message::agent)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageRole;

    fn contents(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(Message::content).collect()
    }

    #[test]
    fn one_chunk_two_lines() {
        let mut parser = OutputLineParser::new(LineMode::PerChunk);
        let messages = parser.push("line1\nline2\n");
        assert_eq!(contents(&messages), vec!["line1", "line2"]);
        assert!(messages.iter().all(|m| m.role() == MessageRole::Agent));
        assert_ne!(messages[0].id(), messages[1].id());
    }

    #[test]
    fn noise_and_blank_lines_dropped() {
        let mut parser = OutputLineParser::new(LineMode::PerChunk);
        let messages = parser.push("\n   \n[DEBUG] token count 12\nreal output\r\n\n");
        assert_eq!(contents(&messages), vec!["real output"]);
    }

    #[test]
    fn per_chunk_splits_straddling_line() {
        let mut parser = OutputLineParser::new(LineMode::PerChunk);
        let mut messages = parser.push("hel");
        messages.extend(parser.push("lo world\n"));
        assert_eq!(contents(&messages), vec!["hel", "lo world"]);
    }

    #[test]
    fn buffered_joins_straddling_line() {
        let mut parser = OutputLineParser::new(LineMode::Buffered);
        assert!(parser.push("hel").is_empty());
        let messages = parser.push("lo world\nnext");
        assert_eq!(contents(&messages), vec!["hello world"]);
        assert_eq!(contents(&parser.flush()), vec!["next"]);
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn buffered_filters_noise_after_joining() {
        let mut parser = OutputLineParser::new(LineMode::Buffered);
        assert!(parser.push("[DEB").is_empty());
        assert!(parser.push("UG] hidden\n").is_empty());
    }
}
