//! Merges a streaming chat completion into the transcript.
//!
//! The API sends newline-delimited `data: {json}` records, each carrying
//! `choices[0].delta` with either a `content` fragment or a partial
//! `function_call`. Chunks from the network do not respect line boundaries,
//! so incomplete lines are buffered until their newline arrives.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::StreamError;
use crate::transcript::Transcript;

/// A completed function call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
}

/// What a single record contributed to the turn.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeStep {
    /// All assistant text received so far in this turn.
    Content(String),
    /// A function call finished streaming and should be dispatched.
    Call(FunctionCall),
}

#[derive(Debug, Default)]
struct FunctionCallInProgress {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct StreamRecord {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCallDelta>,
}

#[derive(Deserialize)]
struct FunctionCallDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Per-turn streaming state.
#[derive(Debug, Default)]
pub struct StreamMerger {
    /// Bytes after the last newline seen so far.
    pending: Vec<u8>,
    /// Assistant text for the message currently open for append.
    accumulated: String,
    call: Option<FunctionCallInProgress>,
    done: bool,
}

impl StreamMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Name of the function call currently being streamed, if any.
    pub fn call_in_progress(&self) -> Option<&str> {
        self.call.as_ref().map(|c| c.name.as_str())
    }

    /// Drop the accumulated text, so the next content delta starts over.
    pub fn restart_text(&mut self) {
        self.accumulated.clear();
    }

    /// Append raw bytes from the response body to the line buffer.
    pub fn buffer(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Take the next complete line out of the buffer, without its newline.
    pub fn next_line(&mut self) -> Option<Result<String, StreamError>> {
        let newline = self.pending.iter().position(|b| *b == b'\n')?;
        let rest = self.pending.split_off(newline + 1);
        let mut line = std::mem::replace(&mut self.pending, rest);
        line.pop();
        Some(String::from_utf8(line).map_err(StreamError::from))
    }

    /// Feed raw bytes from the response body.
    ///
    /// Stops at the first bad line; steps from earlier lines in the same
    /// chunk are lost with it. Callers that must keep them use
    /// [`buffer`](Self::buffer) and [`next_line`](Self::next_line).
    pub fn feed_chunk(&mut self, chunk: &[u8]) -> Result<Vec<MergeStep>, StreamError> {
        self.buffer(chunk);

        let mut steps = Vec::new();
        while let Some(line) = self.next_line() {
            if let Some(step) = self.feed_line(&line?)? {
                steps.push(step);
            }
        }
        Ok(steps)
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Result<Vec<MergeStep>, StreamError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let line = String::from_utf8(std::mem::take(&mut self.pending))?;
        Ok(self.feed_line(&line)?.into_iter().collect())
    }

    /// Process one complete line.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<MergeStep>, StreamError> {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || self.done {
            return Ok(None);
        }

        let Some(data) = line.strip_prefix("data: ") else {
            return Ok(None);
        };

        if data.trim() == "[DONE]" {
            debug!("stream finished");
            self.done = true;
            return Ok(None);
        }

        let record: StreamRecord =
            serde_json::from_str(data).map_err(|e| StreamError::InvalidRecord {
                reason: e.to_string(),
            })?;

        let Some(choice) = record.choices.into_iter().next() else {
            return Ok(None);
        };
        let delta = choice.delta.unwrap_or_default();
        let finishes_call = choice.finish_reason.as_deref() == Some("function_call");

        if let Some(fc) = delta.function_call {
            let call = self.call.get_or_insert_with(|| {
                let name = fc.name.clone().unwrap_or_default();
                debug!(function = %name, "function call started");
                FunctionCallInProgress {
                    name,
                    arguments: String::new(),
                }
            });
            if let Some(fragment) = fc.arguments {
                call.arguments.push_str(&fragment);
            }

            if finishes_call {
                return self.complete_call().map(Some);
            }
            return Ok(None);
        }

        // Some servers send the terminating reason on an empty delta
        if finishes_call && self.call.is_some() {
            return self.complete_call().map(Some);
        }

        match delta.content {
            Some(content) if !content.is_empty() => {
                self.accumulated.push_str(&content);
                Ok(Some(MergeStep::Content(self.accumulated.clone())))
            }
            _ => Ok(None),
        }
    }

    fn complete_call(&mut self) -> Result<MergeStep, StreamError> {
        let call = self.call.take().unwrap_or_default();
        let arguments = serde_json::from_str(&call.arguments).map_err(|e| {
            StreamError::InvalidArguments {
                name: call.name.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!(function = %call.name, "function call complete");
        Ok(MergeStep::Call(FunctionCall {
            name: call.name,
            arguments,
        }))
    }
}

/// Fold accumulated assistant text into the transcript.
///
/// Replaces the last message when it is an assistant message, otherwise
/// appends a new one. Function messages are never appended to.
pub fn apply_content(transcript: &mut Transcript, accumulated: &str) {
    transcript.upsert_assistant(accumulated);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ChatMessage, ChatRole};

    fn content(text: &str) -> String {
        format!(
            "data: {}\n",
            serde_json::json!({"choices": [{"delta": {"content": text}, "finish_reason": null}]})
        )
    }

    fn merge_all(merger: &mut StreamMerger, transcript: &mut Transcript, bytes: &[u8]) {
        for step in merger.feed_chunk(bytes).unwrap() {
            if let MergeStep::Content(text) = step {
                apply_content(transcript, &text);
            }
        }
    }

    #[test]
    fn test_content_deltas_merge_into_one_message() {
        let mut merger = StreamMerger::new();
        let mut transcript = Transcript::from_messages(vec![ChatMessage::user("hi")]);

        merge_all(&mut merger, &mut transcript, content("A").as_bytes());
        merge_all(&mut merger, &mut transcript, content("B").as_bytes());

        assert_eq!(transcript.len(), 2);
        let last = transcript.last().unwrap();
        assert_eq!(last.role, ChatRole::Assistant);
        assert_eq!(last.content, "AB");
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut merger = StreamMerger::new();
        let line = content("hello");
        let (a, b) = line.as_bytes().split_at(10);

        assert!(merger.feed_chunk(a).unwrap().is_empty());
        let steps = merger.feed_chunk(b).unwrap();
        assert_eq!(steps, vec![MergeStep::Content("hello".to_string())]);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let mut merger = StreamMerger::new();
        let line = content("héllo");
        let bytes = line.as_bytes();
        let split = line.find('é').unwrap() + 1;

        assert!(merger.feed_chunk(&bytes[..split]).unwrap().is_empty());
        let steps = merger.feed_chunk(&bytes[split..]).unwrap();
        assert_eq!(steps, vec![MergeStep::Content("héllo".to_string())]);
    }

    #[test]
    fn test_several_records_in_one_chunk() {
        let mut merger = StreamMerger::new();
        let chunk = format!("{}\n{}\r\n", content("a").trim_end(), content("b").trim_end());
        let steps = merger.feed_chunk(chunk.as_bytes()).unwrap();
        assert_eq!(
            steps,
            vec![
                MergeStep::Content("a".to_string()),
                MergeStep::Content("ab".to_string()),
            ]
        );
    }

    #[test]
    fn test_blank_and_foreign_lines_ignored() {
        let mut merger = StreamMerger::new();
        assert!(merger.feed_line("").unwrap().is_none());
        assert!(merger.feed_line("   ").unwrap().is_none());
        assert!(merger.feed_line(": keep-alive").unwrap().is_none());
        assert!(merger.feed_line("event: message").unwrap().is_none());
    }

    #[test]
    fn test_done_sentinel() {
        let mut merger = StreamMerger::new();
        assert!(merger.feed_line("data: [DONE]").unwrap().is_none());
        assert!(merger.is_done());
        // Anything after the sentinel is ignored
        assert!(merger.feed_line(content("late").trim_end()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let mut merger = StreamMerger::new();
        let err = merger.feed_line("data: {not json").unwrap_err();
        assert!(matches!(err, StreamError::InvalidRecord { .. }));
    }

    #[test]
    fn test_empty_content_is_skipped() {
        let mut merger = StreamMerger::new();
        assert!(merger.feed_line(content("").trim_end()).unwrap().is_none());
        let role_only = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(merger.feed_line(role_only).unwrap().is_none());
    }

    #[test]
    fn test_function_call_arguments_accumulate() {
        let mut merger = StreamMerger::new();
        let first = r#"data: {"choices":[{"delta":{"function_call":{"name":"executeCode","arguments":"{\"co"}},"finish_reason":null}]}"#;
        let second = r#"data: {"choices":[{"delta":{"function_call":{"arguments":"de\":\"1+1\"}"}},"finish_reason":"function_call"}]}"#;

        assert!(merger.feed_line(first).unwrap().is_none());
        assert_eq!(merger.call_in_progress(), Some("executeCode"));

        let step = merger.feed_line(second).unwrap();
        assert_eq!(
            step,
            Some(MergeStep::Call(FunctionCall {
                name: "executeCode".to_string(),
                arguments: serde_json::json!({"code": "1+1"}),
            }))
        );
        assert!(merger.call_in_progress().is_none());
    }

    #[test]
    fn test_function_call_finished_by_empty_delta() {
        let mut merger = StreamMerger::new();
        let start = r#"data: {"choices":[{"delta":{"function_call":{"name":"executeCode","arguments":"{\"code\":\"2\"}"}}}]}"#;
        let stop = r#"data: {"choices":[{"delta":{},"finish_reason":"function_call"}]}"#;

        assert!(merger.feed_line(start).unwrap().is_none());
        match merger.feed_line(stop).unwrap() {
            Some(MergeStep::Call(call)) => assert_eq!(call.arguments["code"], "2"),
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_function_call_bad_arguments() {
        let mut merger = StreamMerger::new();
        let line = r#"data: {"choices":[{"delta":{"function_call":{"name":"executeCode","arguments":"{oops"}},"finish_reason":"function_call"}]}"#;
        let err = merger.feed_line(line).unwrap_err();
        assert!(matches!(err, StreamError::InvalidArguments { ref name, .. } if name == "executeCode"));
    }

    #[test]
    fn test_content_after_function_result_opens_new_message() {
        let mut merger = StreamMerger::new();
        let mut transcript = Transcript::new();
        transcript.push(ChatMessage::user("run it"));

        merge_all(&mut merger, &mut transcript, content("Running").as_bytes());
        transcript.push(ChatMessage::function("executeCode", r#"{"result":2}"#));
        merge_all(&mut merger, &mut transcript, content(". It is 2").as_bytes());

        let roles: Vec<ChatRole> = transcript.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::User, ChatRole::Assistant, ChatRole::Function, ChatRole::Assistant]
        );
        assert_eq!(transcript.messages()[1].content, "Running");
        assert_eq!(transcript.messages()[2].content, r#"{"result":2}"#);
        // The accumulator spans the whole turn
        assert_eq!(transcript.messages()[3].content, "Running. It is 2");
    }

    #[test]
    fn test_next_line_leaves_partial_line_buffered() {
        let mut merger = StreamMerger::new();
        merger.buffer(b"data: [DONE]\ndata: {\"cho");

        assert_eq!(merger.next_line().unwrap().unwrap(), "data: [DONE]");
        assert!(merger.next_line().is_none());

        merger.buffer(b"ices\":[]}\n");
        assert_eq!(merger.next_line().unwrap().unwrap(), r#"data: {"choices":[]}"#);
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut merger = StreamMerger::new();
        let line = content("tail");
        assert!(merger.feed_chunk(line.trim_end().as_bytes()).unwrap().is_empty());
        assert_eq!(
            merger.finish().unwrap(),
            vec![MergeStep::Content("tail".to_string())]
        );
        assert!(merger.finish().unwrap().is_empty());
    }
}
