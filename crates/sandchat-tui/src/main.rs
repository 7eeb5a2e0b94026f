use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use colored::*;
use dialoguer::{theme::ColorfulTheme, Confirm};
use futures_util::StreamExt;
use sandchat_core::{
    ChatClient, ChatController, ChatError, ChatRole, Config, FileStore, Previewer, Transcript,
    TranscriptStore,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod app;
mod handler;
mod tui;
mod ui;

use app::App;
use tui::EventHandler;

#[derive(Parser)]
#[command(name = "sandchat")]
#[command(about = "Chat with xAI models and preview the HTML, CSS and JavaScript they write")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the interactive chat (default)
    Chat,
    /// Send one message and stream the reply to stdout
    Send {
        /// Message text
        message: String,
        /// Model to use for this message
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Print the saved conversation
    History,
    /// Delete the saved conversation
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Open the code from a message in the sandboxed browser preview
    Preview {
        /// Message number as shown by `history` (default: latest with code)
        #[arg(short, long)]
        index: Option<usize>,
        /// Open the raw document instead of the sandboxed frame
        #[arg(long)]
        new_tab: bool,
    },
    /// Show or update settings
    Config {
        /// Save an xAI API key
        #[arg(long)]
        api_key: Option<String>,
        /// Save the default model
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().unwrap_or_else(|_| Config::new());
    init_logging(&config)?;

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => run_tui(&config).await?,
        Commands::Send { message, model } => send_message(&config, &message, model.as_deref()).await?,
        Commands::History => print_history()?,
        Commands::Clear { yes } => clear_history(yes)?,
        Commands::Preview { index, new_tab } => open_preview(index, new_tab)?,
        Commands::Config { api_key, model } => update_config(api_key, model)?,
    }

    Ok(())
}

/// Log to a file under the data dir; the terminal belongs to the UI.
fn init_logging(config: &Config) -> Result<()> {
    let log_dir = dirs::data_dir()
        .ok_or_else(|| anyhow!("Could not determine data directory"))?
        .join("sandchat");
    fs::create_dir_all(&log_dir)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("sandchat.log"))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();

    Ok(())
}

async fn run_tui(config: &Config) -> Result<()> {
    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();

    let result = match App::new(config, events.sender()) {
        Ok(mut app) => {
            info!("chat session started");
            run_loop(&mut terminal, &mut app, &mut events).await
        }
        Err(e) => Err(e),
    };

    tui::restore()?;
    result
}

async fn run_loop(terminal: &mut tui::Tui, app: &mut App, events: &mut EventHandler) -> Result<()> {
    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        match events.next().await {
            Some(event) => handler::handle_event(app, event).await?,
            None => break,
        }
    }
    Ok(())
}

fn open_controller(config: &Config) -> Result<ChatController> {
    let store: Box<dyn TranscriptStore> = Box::new(FileStore::default_location()?);
    Ok(ChatController::new(store, Arc::new(config.executor()), config.settings())?)
}

fn load_transcript() -> Result<Transcript> {
    let mut store = FileStore::default_location()?;
    Ok(store.load()?)
}

async fn send_message(config: &Config, message: &str, model: Option<&str>) -> Result<()> {
    let Some(api_key) = config.resolve_api_key() else {
        bail!("No API key configured. Set XAI_API_KEY or run `sandchat config --api-key <KEY>`");
    };

    let mut controller = open_controller(config)?;
    if let Some(model) = model {
        controller.set_model(model);
    }
    let client = ChatClient::new(config.endpoint());

    let request = controller.begin(&api_key, message)?;
    let mut printed = (controller.transcript().len(), 0);

    let outcome = match client.stream(&api_key, &request).await {
        Ok(mut body) => {
            let mut outcome = Ok(());
            while let Some(chunk) = body.next().await {
                let applied = match chunk {
                    Ok(bytes) => controller.apply_chunk(&bytes).await,
                    Err(e) => Err(ChatError::from(e)),
                };
                print_progress(controller.transcript(), &mut printed)?;
                if let Err(e) = applied {
                    outcome = Err(e);
                    break;
                }
                if controller.stream_done() {
                    break;
                }
            }
            outcome
        }
        Err(e) => Err(ChatError::from(e)),
    };

    let result = controller.complete(outcome).await;
    print_progress(controller.transcript(), &mut printed)?;
    println!();
    result?;

    if let Some((index, _)) = controller.transcript().latest_bundle() {
        if index + 1 == controller.transcript().len() {
            println!(
                "{}",
                format!("Code found. Run `sandchat preview --index {}` to open it.", index + 1).dimmed()
            );
        }
    }
    Ok(())
}

/// Print whatever the transcript gained since the last call.
///
/// `printed` is (message index, bytes of that message already shown).
fn print_progress(transcript: &Transcript, printed: &mut (usize, usize)) -> Result<()> {
    let messages = transcript.messages();
    let mut stdout = io::stdout();

    while printed.0 < messages.len() {
        let message = &messages[printed.0];
        match message.role {
            ChatRole::Assistant => {
                if let Some(rest) = message.content.get(printed.1..) {
                    write!(stdout, "{}", rest)?;
                }
                printed.1 = message.content.len();
            }
            ChatRole::Function if printed.1 == 0 => {
                let name = message.name.as_deref().unwrap_or("function");
                writeln!(stdout, "{} {}", format!("⚙ {} →", name).magenta().bold(), message.content)?;
                printed.1 = message.content.len().max(1);
            }
            _ => {}
        }

        if printed.0 + 1 == messages.len() {
            break;
        }
        if message.role == ChatRole::Assistant {
            writeln!(stdout)?;
        }
        printed.0 += 1;
        printed.1 = 0;
    }

    stdout.flush()?;
    Ok(())
}

fn print_history() -> Result<()> {
    let transcript = load_transcript()?;
    if transcript.is_empty() {
        println!("{}", "No saved conversation".yellow());
        return Ok(());
    }

    for (i, message) in transcript.messages().iter().enumerate() {
        let label = match message.role {
            ChatRole::User => "You".cyan().bold(),
            ChatRole::Assistant => "AI".yellow().bold(),
            ChatRole::Function => message.name.as_deref().unwrap_or("function").magenta().bold(),
            ChatRole::System => "System".dimmed(),
        };
        let code = if sandchat_core::extract_code(&message.content).is_some() {
            " [code]".green().to_string()
        } else {
            String::new()
        };
        println!("{} {}{}", format!("#{}", i + 1).dimmed(), label, code);
        println!("{}\n", message.content);
    }
    Ok(())
}

fn clear_history(yes: bool) -> Result<()> {
    let confirmed = yes
        || Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Delete the saved conversation?")
            .default(false)
            .interact()?;

    if !confirmed {
        println!("{}", "Kept the conversation".dimmed());
        return Ok(());
    }

    let mut store = FileStore::default_location()?;
    store.clear()?;
    println!("{}", "Conversation cleared".green());
    Ok(())
}

fn open_preview(index: Option<usize>, new_tab: bool) -> Result<()> {
    let transcript = load_transcript()?;

    let (number, bundle) = match index {
        Some(number) => {
            let message = number
                .checked_sub(1)
                .and_then(|i| transcript.messages().get(i))
                .ok_or_else(|| anyhow!("No message #{} (the conversation has {})", number, transcript.len()))?;
            let bundle = sandchat_core::extract_code(&message.content)
                .ok_or_else(|| anyhow!("Message #{} has no html, css or javascript code", number))?;
            (number, bundle)
        }
        None => {
            let (i, bundle) = transcript
                .latest_bundle()
                .ok_or_else(|| anyhow!("No message with html, css or javascript code"))?;
            (i + 1, bundle)
        }
    };

    let previewer = Previewer::default_location()?;
    let path = if new_tab {
        previewer.open_in_new_tab(&bundle)?
    } else {
        previewer.show(&bundle)?
    };
    println!("{} #{}: {}", "Preview of message".green(), number, path.display());
    Ok(())
}

fn update_config(api_key: Option<String>, model: Option<String>) -> Result<()> {
    if let Some(key) = &api_key {
        Config::save_api_key(key)?;
        println!("{}", "API key saved".green());
    }
    if let Some(model) = &model {
        Config::save_model(model)?;
        println!("{} {}", "Default model set to".green(), model);
    }

    let config = Config::load()?;
    let key_source = if std::env::var(sandchat_core::config::API_KEY_ENV).is_ok() {
        "environment"
    } else if config.api_key.is_some() {
        "config file"
    } else {
        "not set"
    };

    println!("{}", "Settings".bold().blue());
    println!("  config:   {}", Config::get_config_path()?.display());
    println!("  model:    {}", config.model());
    println!("  endpoint: {}", config.endpoint());
    println!("  api key:  {}", key_source);
    Ok(())
}
