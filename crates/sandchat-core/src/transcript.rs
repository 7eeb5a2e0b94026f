//! The ordered conversation and where it is persisted.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::StoreError;
use crate::extract::{extract_code, CodeBundle};
use crate::state::{ChatMessage, ChatRole};

/// File name of the persisted transcript blob.
pub const TRANSCRIPT_FILE: &str = "transcript.json";

/// Chronological list of chat messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Replace the last message's content if it is from the assistant,
    /// otherwise start a new assistant message.
    pub fn upsert_assistant(&mut self, content: &str) {
        match self.messages.last_mut() {
            Some(last) if last.role == ChatRole::Assistant => {
                last.content.clear();
                last.content.push_str(content);
            }
            _ => self.messages.push(ChatMessage::assistant(content)),
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// The most recent message with previewable code, and its index.
    pub fn latest_bundle(&self) -> Option<(usize, CodeBundle)> {
        self.messages
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, m)| extract_code(&m.content).map(|b| (i, b)))
    }
}

/// Persistence for the transcript: one blob, overwritten wholesale.
pub trait TranscriptStore: Send {
    /// Load the saved transcript, or an empty one if nothing is stored.
    fn load(&mut self) -> Result<Transcript, StoreError>;
    fn save(&mut self, transcript: &Transcript) -> Result<(), StoreError>;
    /// Remove the stored blob entirely.
    fn clear(&mut self) -> Result<(), StoreError>;
}

/// JSON file in the platform data directory.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> anyhow::Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?;
        Ok(Self::new(data_dir.join("sandchat").join(TRANSCRIPT_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TranscriptStore for FileStore {
    fn load(&mut self) -> Result<Transcript, StoreError> {
        if !self.path.exists() {
            return Ok(Transcript::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let transcript: Transcript = serde_json::from_str(&content)?;
        debug!(path = %self.path.display(), messages = transcript.len(), "loaded transcript");
        Ok(transcript)
    }

    fn save(&mut self, transcript: &Transcript) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string(transcript)?)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps the serialized blob in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blob: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw stored JSON, if any.
    pub fn blob(&self) -> Option<&str> {
        self.blob.as_deref()
    }
}

impl TranscriptStore for MemoryStore {
    fn load(&mut self) -> Result<Transcript, StoreError> {
        match &self.blob {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(Transcript::new()),
        }
    }

    fn save(&mut self, transcript: &Transcript) -> Result<(), StoreError> {
        self.blob = Some(serde_json::to_string(transcript)?);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.blob = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Transcript {
        Transcript::from_messages(vec![
            ChatMessage::user("make a button"),
            ChatMessage::assistant("```html\n<button>Hi</button>\n```"),
            ChatMessage::function("executeCode", r#"{"result":2}"#),
            ChatMessage::assistant("done"),
        ])
    }

    #[test]
    fn test_upsert_replaces_open_assistant_message() {
        let mut t = Transcript::from_messages(vec![ChatMessage::user("q")]);
        t.upsert_assistant("A");
        t.upsert_assistant("AB");
        assert_eq!(t.len(), 2);
        assert_eq!(t.last().unwrap().content, "AB");
    }

    #[test]
    fn test_upsert_never_merges_into_function_message() {
        let mut t = Transcript::from_messages(vec![ChatMessage::function("executeCode", "{}")]);
        t.upsert_assistant("next");
        assert_eq!(t.len(), 2);
        assert_eq!(t.messages()[0].content, "{}");
        assert_eq!(t.last().unwrap().role, ChatRole::Assistant);
    }

    #[test]
    fn test_serializes_as_plain_array() {
        let t = Transcript::from_messages(vec![ChatMessage::user("x")]);
        assert_eq!(
            serde_json::to_string(&t).unwrap(),
            r#"[{"role":"user","content":"x"}]"#
        );
    }

    #[test]
    fn test_latest_bundle_finds_newest() {
        let mut t = sample();
        assert_eq!(t.latest_bundle().unwrap().0, 1);

        t.push(ChatMessage::assistant("```css\np {}\n```"));
        let (idx, bundle) = t.latest_bundle().unwrap();
        assert_eq!(idx, 4);
        assert_eq!(bundle.css, "p {}");
        assert!(bundle.html.is_empty());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path().join("sub").join(TRANSCRIPT_FILE));

        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), sample());
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path().join(TRANSCRIPT_FILE));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_clear_removes_blob() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path().join(TRANSCRIPT_FILE));

        store.save(&sample()).unwrap();
        assert!(store.path().exists());
        store.clear().unwrap();
        assert!(!store.path().exists());
        // Clearing twice is fine
        store.clear().unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_rejects_corrupt_blob() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TRANSCRIPT_FILE);
        fs::write(&path, "not json").unwrap();
        let mut store = FileStore::new(path);
        assert!(matches!(store.load(), Err(StoreError::Json(_))));
    }

    #[test]
    fn test_memory_store_round_trip() {
        let mut store = MemoryStore::new();
        store.save(&sample()).unwrap();
        assert!(store.blob().is_some());
        assert_eq!(store.load().unwrap(), sample());

        store.clear().unwrap();
        assert!(store.blob().is_none());
    }
}
