//! Terminal setup and the event channel feeding the UI loop.
//!
//! Three kinds of producers send into one unbounded channel: the crossterm
//! input reader, the animation ticker, and one task per chat turn forwarding
//! the response body.

use std::io::{self, Stderr};
use std::time::Duration;
use anyhow::Result;
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture, Event, EventStream, KeyEvent, KeyEventKind, MouseEvent},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use futures_util::StreamExt;
use sandchat_core::{ChatClient, ChatRequest, ClientError};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

pub type Tui = Terminal<CrosstermBackend<Stderr>>;

/// Interval for the "Thinking..." animation.
const TICK_RATE: Duration = Duration::from_millis(300);

#[derive(Debug)]
pub enum StreamEvent {
    Chunk(Vec<u8>),
    End,
    Failed(ClientError),
}

#[derive(Debug)]
pub enum AppEvent {
    Key(KeyEvent),
    Mouse(MouseEvent),
    Resize(u16, u16),
    Tick,
    /// Response data for the turn numbered `turn`.
    Stream { turn: u64, event: StreamEvent },
}

pub struct EventHandler {
    rx: mpsc::UnboundedReceiver<AppEvent>,
    tx: UnboundedSender<AppEvent>,
}

impl EventHandler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_input_reader(tx.clone());
        spawn_ticker(tx.clone(), TICK_RATE);
        Self { rx, tx }
    }

    pub fn sender(&self) -> UnboundedSender<AppEvent> {
        self.tx.clone()
    }

    pub async fn next(&mut self) -> Option<AppEvent> {
        self.rx.recv().await
    }
}

fn spawn_input_reader(tx: UnboundedSender<AppEvent>) {
    tokio::spawn(async move {
        let mut reader = EventStream::new();
        while let Some(evt) = reader.next().await {
            let app_event = match evt {
                // Ignore key release/repeat reports
                Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => AppEvent::Key(key),
                Ok(Event::Mouse(mouse)) => AppEvent::Mouse(mouse),
                Ok(Event::Resize(w, h)) => AppEvent::Resize(w, h),
                _ => continue,
            };
            if tx.send(app_event).is_err() {
                break;
            }
        }
    });
}

fn spawn_ticker(tx: UnboundedSender<AppEvent>, rate: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(rate);
        loop {
            interval.tick().await;
            if tx.send(AppEvent::Tick).is_err() {
                break;
            }
        }
    });
}

/// Send `request` and forward the response body chunk by chunk.
///
/// Exactly one terminal event (`End` or `Failed`) follows the chunks unless
/// the receiver goes away first.
pub fn spawn_response_stream(
    tx: UnboundedSender<AppEvent>,
    turn: u64,
    client: ChatClient,
    api_key: String,
    request: ChatRequest,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let send = |event| tx.send(AppEvent::Stream { turn, event }).is_ok();

        let mut body = match client.stream(&api_key, &request).await {
            Ok(body) => body,
            Err(e) => {
                send(StreamEvent::Failed(e));
                return;
            }
        };

        while let Some(chunk) = body.next().await {
            let delivered = match chunk {
                Ok(bytes) => send(StreamEvent::Chunk(bytes)),
                Err(e) => {
                    send(StreamEvent::Failed(e));
                    return;
                }
            };
            if !delivered {
                return;
            }
        }
        send(StreamEvent::End);
    })
}

pub fn init() -> Result<Tui> {
    enable_raw_mode()?;
    execute!(io::stderr(), EnterAlternateScreen, EnableMouseCapture)?;
    Ok(Terminal::new(CrosstermBackend::new(io::stderr()))?)
}

pub fn restore() -> Result<()> {
    execute!(io::stderr(), DisableMouseCapture, LeaveAlternateScreen)?;
    disable_raw_mode()?;
    Ok(())
}

/// Restore the terminal before the default panic message prints.
pub fn install_panic_hook() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = restore();
        original_hook(panic_info);
    }));
}
