pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod extract;
pub mod functions;
pub mod markdown;
pub mod preview;
pub mod state;
pub mod stream;
pub mod transcript;

// Re-export main types for convenience
pub use client::{ChatClient, ChatRequest};
pub use config::Config;
pub use controller::{ChatController, ChatSettings, RequestState};
pub use error::{ChatError, ClientError, StoreError, StreamError, SubmitError};
pub use extract::{extract_code, CodeBundle};
pub use functions::{ExecutionOutcome, Executor, NodeExecutor};
pub use markdown::{MarkdownVisitor, RenderedMessage};
pub use preview::Previewer;
pub use state::{ChatMessage, ChatRole};
pub use stream::{FunctionCall, MergeStep, StreamMerger};
pub use transcript::{FileStore, MemoryStore, Transcript, TranscriptStore};
