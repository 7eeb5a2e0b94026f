use std::sync::Arc;
use sandchat_core::{
    ChatClient, ChatController, ChatError, CodeBundle, Config, FileStore, Previewer,
    SubmitError, TranscriptStore,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::tui::{spawn_response_stream, AppEvent, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
    ApiKey,
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub input_mode: InputMode,

    // Conversation
    pub controller: ChatController,
    pub client: ChatClient,
    pub api_key: String,

    // Message input
    pub input: String,
    pub input_cursor: usize, // cursor position in chars

    // API key input state
    pub api_key_input: String,
    pub api_key_input_cursor: usize,

    // Chat pane scroll state
    pub chat_scroll: u16,
    pub chat_height: u16, // inner height, updated during render
    pub total_chat_lines: u16,
    pub follow_output: bool,

    // Preview
    pub previewer: Previewer,
    pub preview: Option<(usize, CodeBundle)>,
    pub show_preview_panel: bool,

    // Animation state
    pub animation_frame: u8, // 0-2 for ellipsis animation

    /// Last error or notice shown in the footer.
    pub status: Option<String>,

    // Streaming
    turn: u64,
    stream_task: Option<JoinHandle<()>>,
    events: UnboundedSender<AppEvent>,
}

impl App {
    pub fn new(config: &Config, events: UnboundedSender<AppEvent>) -> anyhow::Result<Self> {
        let store: Box<dyn TranscriptStore> = Box::new(FileStore::default_location()?);
        let controller = ChatController::new(store, Arc::new(config.executor()), config.settings())?;
        Ok(Self::with_controller(
            controller,
            ChatClient::new(config.endpoint()),
            config.resolve_api_key().unwrap_or_default(),
            Previewer::default_location()?,
            events,
        ))
    }

    pub fn with_controller(
        controller: ChatController,
        client: ChatClient,
        api_key: String,
        previewer: Previewer,
        events: UnboundedSender<AppEvent>,
    ) -> Self {
        let mut app = Self {
            should_quit: false,
            input_mode: InputMode::Editing,
            controller,
            client,
            api_key,
            input: String::new(),
            input_cursor: 0,
            api_key_input: String::new(),
            api_key_input_cursor: 0,
            chat_scroll: 0,
            chat_height: 0,
            total_chat_lines: 0,
            follow_output: true,
            previewer,
            preview: None,
            show_preview_panel: true,
            animation_frame: 0,
            status: None,
            turn: 0,
            stream_task: None,
            events,
        };
        app.refresh_preview();
        if app.api_key.is_empty() {
            app.open_api_key_input();
        }
        app
    }

    /// Counter of submitted turns; stream events carry it.
    #[cfg(test)]
    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Start a turn with the current input.
    ///
    /// Missing key and blank input are ignored; a second send while
    /// streaming is reported in the footer.
    pub fn submit(&mut self) {
        let request = match self.controller.begin(&self.api_key, &self.input) {
            Ok(request) => request,
            Err(SubmitError::Busy) => {
                self.status = Some("Still waiting for the current reply".to_string());
                return;
            }
            Err(_) => return,
        };

        self.input.clear();
        self.input_cursor = 0;
        self.status = None;
        self.follow_output = true;
        self.turn += 1;

        self.stream_task = Some(spawn_response_stream(
            self.events.clone(),
            self.turn,
            self.client.clone(),
            self.api_key.clone(),
            request,
        ));
    }

    /// Apply a stream event from the background request task.
    pub async fn on_stream_event(&mut self, turn: u64, event: StreamEvent) {
        if turn != self.turn || !self.controller.is_streaming() {
            return;
        }

        match event {
            StreamEvent::Chunk(bytes) => {
                if let Err(e) = self.controller.apply_chunk(&bytes).await {
                    self.finish_turn(Err(e)).await;
                    return;
                }
                if self.controller.stream_done() {
                    self.finish_turn(Ok(())).await;
                }
            }
            StreamEvent::End => self.finish_turn(Ok(())).await,
            StreamEvent::Failed(e) => self.finish_turn(Err(e.into())).await,
        }
        self.refresh_preview();
    }

    async fn finish_turn(&mut self, outcome: Result<(), ChatError>) {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        if let Err(e) = self.controller.complete(outcome).await {
            self.status = Some(format!("Request failed: {}", e));
        }
        self.refresh_preview();
    }

    /// Re-scan the transcript for the newest previewable message.
    pub fn refresh_preview(&mut self) {
        self.preview = self.controller.transcript().latest_bundle();
    }

    pub fn open_preview(&mut self) {
        let Some((_, bundle)) = &self.preview else {
            self.status = Some("No HTML, CSS or JavaScript to preview".to_string());
            return;
        };
        match self.previewer.show(bundle) {
            Ok(path) => {
                info!(path = %path.display(), "preview opened");
                self.status = Some(format!("Preview opened: {}", path.display()));
            }
            Err(e) => {
                warn!(error = %e, "failed to open preview");
                self.status = Some(format!("Could not open preview: {}", e));
            }
        }
    }

    pub fn open_preview_in_new_tab(&mut self) {
        let Some((_, bundle)) = &self.preview else {
            self.status = Some("No HTML, CSS or JavaScript to preview".to_string());
            return;
        };
        match self.previewer.open_in_new_tab(bundle) {
            Ok(path) => self.status = Some(format!("Opened in new tab: {}", path.display())),
            Err(e) => {
                warn!(error = %e, "failed to open preview tab");
                self.status = Some(format!("Could not open preview: {}", e));
            }
        }
    }

    pub fn clear_chat(&mut self) {
        if self.controller.is_streaming() {
            self.status = Some("Cannot clear while a reply is streaming".to_string());
            return;
        }
        match self.controller.clear() {
            Ok(()) => self.status = None,
            Err(e) => {
                warn!(error = %e, "failed to remove saved transcript");
                self.status = Some(format!("Transcript cleared, but the saved copy remains: {}", e));
            }
        }
        self.preview = None;
        self.chat_scroll = 0;
        self.follow_output = true;
    }

    pub fn open_api_key_input(&mut self) {
        self.api_key_input.clear();
        self.api_key_input_cursor = 0;
        self.input_mode = InputMode::ApiKey;
    }

    /// Use the typed key for this session and persist it to the config file.
    pub fn save_api_key_input(&mut self) {
        let key = self.api_key_input.trim().to_string();
        self.api_key_input.clear();
        self.api_key_input_cursor = 0;
        self.input_mode = InputMode::Editing;
        if key.is_empty() {
            return;
        }

        if let Err(e) = Config::save_api_key(&key) {
            warn!(error = %e, "failed to save API key");
            self.status = Some(format!("API key set for this session only: {}", e));
        } else {
            self.status = Some("API key saved".to_string());
        }
        self.api_key = key;
    }

    pub fn tick_animation(&mut self) {
        if self.controller.is_streaming() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    fn max_scroll(&self) -> u16 {
        self.total_chat_lines.saturating_sub(self.chat_height)
    }

    pub fn scroll_up(&mut self, lines: u16) {
        self.follow_output = false;
        self.chat_scroll = self.chat_scroll.saturating_sub(lines);
    }

    pub fn scroll_down(&mut self, lines: u16) {
        self.chat_scroll = self.chat_scroll.saturating_add(lines).min(self.max_scroll());
        self.follow_output = self.chat_scroll >= self.max_scroll();
    }

    pub fn scroll_half_page_up(&mut self) {
        self.scroll_up((self.chat_height / 2).max(1));
    }

    pub fn scroll_half_page_down(&mut self) {
        self.scroll_down((self.chat_height / 2).max(1));
    }

    pub fn scroll_to_top(&mut self) {
        self.follow_output = false;
        self.chat_scroll = 0;
    }

    pub fn scroll_to_bottom(&mut self) {
        self.follow_output = true;
        self.chat_scroll = self.max_scroll();
    }

    /// Record the rendered chat size; keeps the view pinned to the bottom
    /// while following output.
    pub fn update_chat_metrics(&mut self, total_lines: u16, height: u16) {
        self.total_chat_lines = total_lines;
        self.chat_height = height;
        if self.follow_output {
            self.chat_scroll = self.max_scroll();
        } else {
            self.chat_scroll = self.chat_scroll.min(self.max_scroll());
        }
    }
}
