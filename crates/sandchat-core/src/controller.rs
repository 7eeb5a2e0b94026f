//! Chat turn orchestration.
//!
//! [`ChatController`] owns the transcript and its store. A turn is
//! `begin` (validate, append the user message, build the request), any
//! number of `apply_chunk` calls with response bytes, then `complete`.
//! Front ends that read the HTTP stream elsewhere (the TUI forwards chunks
//! through its event channel) call these steps directly; `run_turn` does the
//! whole thing inline.

use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::client::{ChatClient, ChatRequest, DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT, TEMPERATURE};
use crate::error::{ChatError, ClientError, Result, StoreError, SubmitError};
use crate::functions::{available_functions, dispatch, Executor};
use crate::state::ChatMessage;
use crate::stream::{apply_content, MergeStep, StreamMerger};
use crate::transcript::{Transcript, TranscriptStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Streaming,
}

/// Per-request settings sent with every turn.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub model: String,
    pub system_prompt: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

pub struct ChatController {
    transcript: Transcript,
    store: Box<dyn TranscriptStore>,
    executor: Arc<dyn Executor>,
    settings: ChatSettings,
    state: RequestState,
    merger: StreamMerger,
}

impl ChatController {
    /// Create a controller, restoring the transcript from `store`.
    pub fn new(
        mut store: Box<dyn TranscriptStore>,
        executor: Arc<dyn Executor>,
        settings: ChatSettings,
    ) -> Result<Self, StoreError> {
        let transcript = store.load()?;
        info!(messages = transcript.len(), "transcript restored");
        Ok(Self {
            transcript,
            store,
            executor,
            settings,
            state: RequestState::Idle,
            merger: StreamMerger::new(),
        })
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == RequestState::Streaming
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn set_model(&mut self, model: &str) {
        self.settings.model = model.to_string();
    }

    /// Name of the function call being streamed right now, if any.
    pub fn pending_call(&self) -> Option<&str> {
        self.merger.call_in_progress()
    }

    /// Validate a submission and start a turn.
    ///
    /// On success the user message is in the transcript and the returned
    /// request carries the system prompt plus the whole conversation.
    pub fn begin(&mut self, api_key: &str, input: &str) -> Result<ChatRequest, SubmitError> {
        if api_key.trim().is_empty() {
            return Err(SubmitError::MissingCredential);
        }
        if input.trim().is_empty() {
            return Err(SubmitError::EmptyInput);
        }
        if self.is_streaming() {
            warn!("submission rejected while a response is streaming");
            return Err(SubmitError::Busy);
        }

        self.transcript.push(ChatMessage::user(input));
        self.persist();

        self.merger = StreamMerger::new();
        self.state = RequestState::Streaming;

        let mut messages = Vec::with_capacity(self.transcript.len() + 1);
        messages.push(ChatMessage::system(self.settings.system_prompt.clone()));
        messages.extend(self.transcript.messages().iter().cloned());

        info!(model = %self.settings.model, messages = messages.len(), "starting chat turn");
        Ok(ChatRequest {
            model: self.settings.model.clone(),
            messages,
            stream: true,
            temperature: TEMPERATURE,
            functions: available_functions(),
        })
    }

    /// Merge a chunk of response bytes into the transcript.
    ///
    /// Each line is applied as soon as it is parsed, so a bad line later in
    /// the chunk does not undo the lines before it. Completed function calls
    /// are executed before this returns, so chunks applied afterwards land
    /// after the function result.
    pub async fn apply_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.merger.buffer(chunk);
        while let Some(line) = self.merger.next_line() {
            if let Some(step) = self.merger.feed_line(&line?)? {
                self.apply_step(step).await;
            }
        }
        Ok(())
    }

    /// `true` once the server has sent its end-of-stream sentinel.
    pub fn stream_done(&self) -> bool {
        self.merger.is_done()
    }

    async fn apply_step(&mut self, step: MergeStep) {
        match step {
            MergeStep::Content(text) => {
                apply_content(&mut self.transcript, &text);
            }
            MergeStep::Call(call) => {
                let result = dispatch(self.executor.as_ref(), &call).await;
                info!(function = %call.name, "function call dispatched");
                self.transcript.push(ChatMessage::function(call.name, result));
            }
        }
        self.persist();
    }

    /// Finish the turn. Partial output already merged is kept either way.
    pub async fn complete(&mut self, outcome: Result<()>) -> Result<()> {
        let outcome = match outcome {
            Ok(()) => match self.merger.finish() {
                Ok(steps) => {
                    for step in steps {
                        self.apply_step(step).await;
                    }
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(()) => info!(messages = self.transcript.len(), "chat turn complete"),
            Err(e) => error!(error = %e, "chat turn failed"),
        }

        self.state = RequestState::Idle;
        outcome
    }

    /// Feed an entire response stream through the merger.
    pub async fn drive<S>(&mut self, mut stream: S) -> Result<()>
    where
        S: Stream<Item = Result<Vec<u8>, ClientError>> + Unpin,
    {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            self.apply_chunk(&chunk).await?;
            if self.merger.is_done() {
                break;
            }
        }
        Ok(())
    }

    /// Run a full turn against the API.
    pub async fn run_turn(&mut self, client: &ChatClient, api_key: &str, input: &str) -> Result<()> {
        let request = self.begin(api_key, input)?;
        let outcome = match client.stream(api_key, &request).await {
            Ok(stream) => self.drive(stream).await,
            Err(e) => Err(ChatError::from(e)),
        };
        self.complete(outcome).await
    }

    /// Empty the transcript and remove the persisted copy.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.transcript.clear();
        self.merger.restart_text();
        info!("transcript cleared");
        self.store.clear()
    }

    fn persist(&mut self) {
        if let Err(e) = self.store.save(&self.transcript) {
            warn!(error = %e, "failed to save transcript");
        }
    }
}
