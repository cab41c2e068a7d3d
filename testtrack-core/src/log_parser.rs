// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Folds a child process's stdout into a [`StructuredLog`].
//!
//! The parser is fed one line at a time (`parse_line`) so the executor
//! can stream a child's stdout through it as lines arrive, rather than
//! buffering the whole output before parsing.

use testtrack_metadata::log_event::{
    Block, BlockKind, CheckResult, ErrorEvent, Feature, Frame, Measurement, ParseErrorEvent,
    RawEvent, SENTINEL, StructuredLog,
};

/// Incremental parser state for one test's stdout.
#[derive(Debug, Default)]
pub struct LogParser {
    /// Currently open frames, outermost (the block) first.
    stack: Vec<Frame>,
    current_block_kind: Option<BlockKind>,
    blocks: Vec<Block>,
    has_rigging_failure: bool,
    parse_errors: Vec<ParseErrorEvent>,
    /// Non-`[TST]`-prefixed lines, passed through verbatim as plain
    /// stdout.
    passthrough: Vec<String>,
}

impl LogParser {
    /// A fresh parser with no open frames.
    pub fn new() -> Self {
        Self::default()
    }

    fn record_parse_error(&mut self, message: String, raw_line: Option<String>) {
        self.parse_errors.push(ParseErrorEvent { message, raw_line });
    }

    /// The dot-path of currently open step names, used to prefix
    /// measurement names with the open step path. The block frame
    /// itself doesn't participate in the path.
    fn step_path_prefix(&self, name: &str) -> String {
        if self.stack.len() <= 1 {
            return name.to_string();
        }
        let path: Vec<&str> = self.stack[1..].iter().map(|f| f.name.as_str()).collect();
        format!("{}/{}", path.join("/"), name)
    }

    /// Feeds one line of child stdout to the parser.
    pub fn parse_line(&mut self, line: &str) {
        let trimmed = line.trim_start();
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let first_token = parts.next().unwrap_or("");
        if first_token != SENTINEL {
            self.passthrough.push(line.to_string());
            return;
        }
        let json_part = parts.next().unwrap_or("").trim_start();
        match serde_json::from_str::<RawEvent>(json_part) {
            Ok(event) => self.apply(event),
            Err(err) => {
                self.record_parse_error(format!("malformed [TST] payload: {err}"), Some(line.to_string()));
            }
        }
    }

    fn apply(&mut self, event: RawEvent) {
        match event {
            RawEvent::BlockStart { block } => {
                if !self.stack.is_empty() {
                    self.record_parse_error(format!("block_start `{block}` is not at top level"), None);
                    return;
                }
                self.current_block_kind = Some(BlockKind::from_name(&block));
                self.stack.push(Frame::new(block));
            }
            RawEvent::BlockEnd { block } => {
                if self.stack.len() != 1 || self.stack[0].name != block {
                    self.record_parse_error(format!("unmatched block_end `{block}`"), None);
                    return;
                }
                let frame = self.stack.pop().expect("checked len == 1 above");
                let kind = self.current_block_kind.take().unwrap_or(BlockKind::Other);
                self.blocks.push(Block { kind, frame });
            }
            RawEvent::StepStart { step, description: _ } => {
                if self.stack.is_empty() {
                    self.record_parse_error(format!("step_start `{step}` outside any block"), None);
                    return;
                }
                self.stack.push(Frame::new(step));
            }
            RawEvent::StepEnd { step } => {
                if self.stack.len() < 2 || self.stack.last().map(|f| f.name.as_str()) != Some(step.as_str()) {
                    self.record_parse_error(format!("unmatched step_end `{step}`"), None);
                    return;
                }
                let child = self.stack.pop().expect("checked len >= 2 above");
                let child_failed = child.failed;
                let parent = self.stack.last_mut().expect("checked len >= 2 above");
                parent.children.push(child);
                if child_failed {
                    parent.failed = true;
                }
            }
            RawEvent::Measurement { name, value, unit } => {
                if self.stack.is_empty() {
                    self.record_parse_error(format!("measurement `{name}` outside any block"), None);
                    return;
                }
                let prefixed = self.step_path_prefix(&name);
                self.stack
                    .last_mut()
                    .expect("checked non-empty above")
                    .measurements
                    .push(Measurement { name: prefixed, value, unit });
            }
            RawEvent::Result { name, passed } => {
                if self.stack.is_empty() {
                    self.record_parse_error(format!("result `{name}` outside any block"), None);
                    return;
                }
                let frame = self.stack.last_mut().expect("checked non-empty above");
                frame.results.push(CheckResult { name, passed });
                if !passed {
                    frame.failed = true;
                }
            }
            RawEvent::Feature { name, action } => {
                if self.stack.is_empty() {
                    self.record_parse_error(format!("feature `{name}` outside any block"), None);
                    return;
                }
                self.stack
                    .last_mut()
                    .expect("checked non-empty above")
                    .features
                    .push(Feature { name, action });
            }
            RawEvent::Error { name, message } => {
                if self.stack.is_empty() {
                    self.record_parse_error(format!("error `{name}` outside any block"), None);
                    return;
                }
                if self.current_block_kind == Some(BlockKind::Rigging) {
                    self.has_rigging_failure = true;
                }
                for frame in &mut self.stack {
                    frame.failed = true;
                }
                self.stack
                    .last_mut()
                    .expect("checked non-empty above")
                    .errors
                    .push(ErrorEvent { name, message });
            }
        }
    }

    /// Finalizes the parse: any still-open frames are closed (spec
    /// §4.2: "EOF with open frames is recorded as a parse error
    /// attached to the outermost unclosed frame; the parser recovers
    /// by closing all open frames"). Returns the structured log and
    /// every passthrough line, in arrival order.
    pub fn finish(mut self) -> (StructuredLog, Vec<String>) {
        if !self.stack.is_empty() {
            self.record_parse_error("reached end of output with unclosed frames".to_string(), None);
            while self.stack.len() > 1 {
                let child = self.stack.pop().expect("checked len > 1 above");
                let child_failed = child.failed;
                let parent = self.stack.last_mut().expect("checked len > 1 above");
                parent.children.push(child);
                if child_failed {
                    parent.failed = true;
                }
            }
            if let Some(frame) = self.stack.pop() {
                let kind = self.current_block_kind.take().unwrap_or(BlockKind::Other);
                self.blocks.push(Block { kind, frame });
            }
        }
        (
            StructuredLog {
                blocks: self.blocks,
                has_rigging_failure: self.has_rigging_failure,
                parse_errors: self.parse_errors,
            },
            self.passthrough,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tst(json: &str) -> String {
        format!("{SENTINEL} {json}")
    }

    #[test]
    fn passthrough_lines_are_preserved_in_order() {
        let mut parser = LogParser::new();
        parser.parse_line("building...");
        parser.parse_line("done");
        let (_, passthrough) = parser.finish();
        assert_eq!(passthrough, vec!["building...".to_string(), "done".to_string()]);
    }

    #[test]
    fn nested_step_under_block_builds_tree() {
        let mut parser = LogParser::new();
        parser.parse_line(&tst(r#"{"type":"block_start","block":"stimulation"}"#));
        parser.parse_line(&tst(r#"{"type":"step_start","step":"s1","description":"do thing"}"#));
        parser.parse_line(&tst(r#"{"type":"measurement","name":"latency_ms","value":12.5,"unit":"ms"}"#));
        parser.parse_line(&tst(r#"{"type":"step_end","step":"s1"}"#));
        parser.parse_line(&tst(r#"{"type":"block_end","block":"stimulation"}"#));
        let (log, _) = parser.finish();
        assert_eq!(log.blocks.len(), 1);
        assert_eq!(log.blocks[0].kind, BlockKind::Stimulation);
        let step = &log.blocks[0].frame.children[0];
        assert_eq!(step.measurements[0].name, "s1/latency_ms");
        assert!(!log.blocks[0].frame.failed);
        assert!(log.parse_errors.is_empty());
    }

    #[test]
    fn failed_result_propagates_to_ancestor_on_close() {
        let mut parser = LogParser::new();
        parser.parse_line(&tst(r#"{"type":"block_start","block":"checkpoint"}"#));
        parser.parse_line(&tst(r#"{"type":"step_start","step":"inner","description":"x"}"#));
        parser.parse_line(&tst(r#"{"type":"result","name":"assert1","passed":false}"#));
        parser.parse_line(&tst(r#"{"type":"step_end","step":"inner"}"#));
        parser.parse_line(&tst(r#"{"type":"block_end","block":"checkpoint"}"#));
        let (log, _) = parser.finish();
        assert!(log.blocks[0].frame.children[0].failed);
        assert!(log.blocks[0].frame.failed);
        assert!(!log.has_rigging_failure);
    }

    #[test]
    fn error_in_rigging_block_sets_rigging_failure_flag() {
        let mut parser = LogParser::new();
        parser.parse_line(&tst(r#"{"type":"block_start","block":"rigging"}"#));
        parser.parse_line(&tst(r#"{"type":"error","name":"setup","message":"could not provision"}"#));
        parser.parse_line(&tst(r#"{"type":"block_end","block":"rigging"}"#));
        let (log, _) = parser.finish();
        assert!(log.has_rigging_failure);
        assert!(log.blocks[0].frame.failed);
    }

    #[test]
    fn error_marks_all_open_ancestors_immediately() {
        let mut parser = LogParser::new();
        parser.parse_line(&tst(r#"{"type":"block_start","block":"stimulation"}"#));
        parser.parse_line(&tst(r#"{"type":"step_start","step":"outer","description":"x"}"#));
        parser.parse_line(&tst(r#"{"type":"step_start","step":"inner","description":"y"}"#));
        parser.parse_line(&tst(r#"{"type":"error","name":"boom","message":"bad"}"#));
        parser.parse_line(&tst(r#"{"type":"step_end","step":"inner"}"#));
        parser.parse_line(&tst(r#"{"type":"step_end","step":"outer"}"#));
        parser.parse_line(&tst(r#"{"type":"block_end","block":"stimulation"}"#));
        let (log, _) = parser.finish();
        let outer = &log.blocks[0].frame.children[0];
        assert!(outer.failed);
        assert!(outer.children[0].failed);
    }

    #[test]
    fn malformed_json_recorded_as_parse_error_and_recovered() {
        let mut parser = LogParser::new();
        parser.parse_line(&format!("{SENTINEL} not json"));
        parser.parse_line("plain output still flows");
        let (log, passthrough) = parser.finish();
        assert_eq!(log.parse_errors.len(), 1);
        assert_eq!(passthrough, vec!["plain output still flows".to_string()]);
    }

    #[test]
    fn unmatched_step_end_is_recorded_and_ignored() {
        let mut parser = LogParser::new();
        parser.parse_line(&tst(r#"{"type":"block_start","block":"stimulation"}"#));
        parser.parse_line(&tst(r#"{"type":"step_end","step":"never_opened"}"#));
        parser.parse_line(&tst(r#"{"type":"block_end","block":"stimulation"}"#));
        let (log, _) = parser.finish();
        assert_eq!(log.parse_errors.len(), 1);
        assert_eq!(log.blocks.len(), 1);
    }

    #[test]
    fn eof_with_open_frames_force_closes_and_records_error() {
        let mut parser = LogParser::new();
        parser.parse_line(&tst(r#"{"type":"block_start","block":"stimulation"}"#));
        parser.parse_line(&tst(r#"{"type":"step_start","step":"s1","description":"x"}"#));
        let (log, _) = parser.finish();
        assert_eq!(log.blocks.len(), 1);
        assert_eq!(log.blocks[0].frame.children.len(), 1);
        assert_eq!(log.parse_errors.len(), 1);
    }
}
