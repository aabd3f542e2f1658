use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use voicechat_core::session;
use voicechat_core::transcript::{self, TranscriptStore};
use voicechat_core::{
    BackendClient, Config, DeliveryClient, DeliveryHandle, DeliveryTask, FileStore, InboxSource,
    LocalStore, MemoryStore, PollSource, Presenter, PushSource, Transport,
};

mod app;
mod handler;
mod presenter;
mod tui;
mod ui;

use app::{App, AppParts};
use presenter::{format_entry, ConsolePresenter, TuiPresenter};
use tui::{AppEvent, EventHandler};

#[derive(Parser)]
#[command(name = "voicechat", version)]
#[command(about = "Chat with the voice assistant demo backend and receive tool-call results live")]
struct Cli {
    /// Backend base URL (overrides config and VOICECHAT_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Reuse an existing browser session id
    #[arg(long, global = true)]
    session: Option<String>,
    /// Delivery transport: push or poll
    #[arg(long, global = true, value_parser = parse_transport)]
    transport: Option<Transport>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (default)
    Chat,
    /// Print incoming messages without the chat UI
    Watch,
    /// Check backend health and configuration
    Status,
    /// Print the locally stored transcript
    History {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear the backend inbox and the local transcript
    Clear,
    /// Show the effective configuration
    Config {
        /// Write flags and environment overrides to the config file
        #[arg(long)]
        save: bool,
    },
    /// Show or edit the SaaS branding
    Branding {
        #[command(subcommand)]
        action: BrandingAction,
    },
}

#[derive(Subcommand)]
enum BrandingAction {
    Show,
    /// Set one field, e.g. `company_name "Acme GmbH"`
    Set { field: String, value: String },
}

fn parse_transport(s: &str) -> Result<Transport, String> {
    Transport::from_str(s).ok_or_else(|| format!("unknown transport '{}', expected push or poll", s))
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.base_url {
            config.base_url = Some(url.clone());
        }
        if let Some(session) = &self.session {
            config.session_id = Some(session.clone());
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut config, config_error) = Config::load_with_env();
    cli.apply(&mut config);

    let command = cli.command.unwrap_or(Commands::Chat);
    init_logging(&config, matches!(command, Commands::Chat));
    if let Some(e) = config_error {
        log::warn!("Ignoring unreadable config: {}", e);
    }

    match command {
        Commands::Chat => run_chat(config).await,
        Commands::Watch => run_watch(config).await,
        Commands::Status => run_status(&config).await,
        Commands::History { json } => run_history(&config, json),
        Commands::Clear => run_clear(&config).await,
        Commands::Config { save } => run_config(&config, save),
        Commands::Branding { action } => run_branding(&config, action).await,
    }
}

/// The TUI owns the terminal, so its log goes to a file.
fn init_logging(config: &Config, to_file: bool) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if to_file {
        let file = config
            .data_dir()
            .and_then(|dir| {
                std::fs::create_dir_all(&dir)?;
                Ok(std::fs::File::create(dir.join("voicechat.log"))?)
            });
        match file {
            Ok(file) => builder.target(env_logger::Target::Pipe(Box::new(file))),
            Err(_) => builder.target(env_logger::Target::Pipe(Box::new(std::io::sink()))),
        };
    }
    builder.init();
}

fn open_store(config: &Config) -> Box<dyn LocalStore> {
    let store = config
        .data_dir()
        .and_then(|dir| FileStore::open(&dir.join("transcripts")));
    match store {
        Ok(store) => Box::new(store),
        Err(e) => {
            log::warn!("Transcripts will not be saved: {}", e);
            Box::new(MemoryStore::new())
        }
    }
}

/// Loads the transcript and starts delivery for a fresh or pinned session.
fn start_delivery<P>(config: &Config, backend: &BackendClient, presenter: P) -> (String, DeliveryHandle)
where
    P: Presenter + Send + 'static,
{
    let session_id = session::browser_session_id(config);
    let transcript = TranscriptStore::load(open_store(config), &session_id);
    let client = DeliveryClient::new(transcript, presenter, tokio::time::Instant::now());

    let source = match config.transport {
        Transport::Poll => InboxSource::Poll(PollSource::new(Arc::new(backend.clone()))),
        Transport::Push => InboxSource::Push(PushSource::new(Arc::new(backend.clone()))),
    };
    (session_id, DeliveryTask::spawn(client, source))
}

async fn run_chat(config: Config) -> Result<()> {
    let backend = BackendClient::new(config.base_url());
    let assistant_id = config.assistant_id.clone().unwrap_or_default();
    if assistant_id.is_empty() {
        log::warn!("No assistant id configured, the backend default will be used");
    }

    let mut events = EventHandler::new();
    let (session_id, delivery) = start_delivery(&config, &backend, TuiPresenter::new(events.sender()));
    log::info!("Chat session {} against {}", session_id, backend.base_url());

    {
        let backend = backend.clone();
        let config = config.clone();
        let session_id = session_id.clone();
        let tx = events.sender();
        tokio::spawn(async move {
            let ok = session::register(&backend, &config, &session_id).await;
            let _ = tx.send(AppEvent::Registered(ok));
        });
    }
    {
        let backend = backend.clone();
        let tx = events.sender();
        tokio::spawn(async move {
            match backend.saas_config().await {
                Ok(branding) => {
                    let _ = tx.send(AppEvent::Branding(branding));
                }
                Err(e) => log::debug!("No branding available: {}", e),
            }
        });
    }

    let mut app = App::new(AppParts {
        backend,
        delivery,
        session_id,
        assistant_id,
        profile: config.profile.clone(),
        events: events.sender(),
    });

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let result = run_loop(&mut terminal, &mut app, &mut events).await;
    tui::restore()?;

    app.delivery.shutdown().await;
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

async fn run_watch(config: Config) -> Result<()> {
    let backend = BackendClient::new(config.base_url());
    let (session_id, delivery) = start_delivery(&config, &backend, ConsolePresenter::stdout());
    println!(
        "Watching session {} on {} via {} (Ctrl-C to stop)",
        session_id,
        backend.base_url(),
        config.transport.as_str()
    );

    if !session::register(&backend, &config, &session_id).await {
        eprintln!("Warning: session not registered, tool results may not be routed here");
    }

    let mut status = delivery.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                log::info!(
                    "Delivery {} via {} (interval {}ms, {} empty polls)",
                    current.phase.as_str(),
                    current.transport,
                    current.poll_interval_ms,
                    current.consecutive_empty_polls
                );
            }
        }
    }

    delivery.shutdown().await;
    Ok(())
}

async fn run_status(config: &Config) -> Result<()> {
    let backend = BackendClient::new(config.base_url());
    println!("Backend: {}", backend.base_url());

    match backend.health().await {
        Ok(health) => println!("Health:  {} (redis: {})", health.status, health.redis),
        Err(e) => {
            println!("Health:  unreachable ({})", e);
            return Ok(());
        }
    }

    let status = backend.config_status().await?;
    if status.is_complete {
        println!("Config:  complete");
    } else {
        println!("Config:  incomplete");
        for item in status.missing_items {
            println!("  - {}", item);
        }
    }
    Ok(())
}

fn resolve_session(config: &Config, store: &dyn LocalStore) -> Result<String> {
    if let Some(id) = config.session_id.as_deref().filter(|id| !id.trim().is_empty()) {
        return Ok(id.trim().to_string());
    }
    transcript::latest_session_id(store)?
        .ok_or_else(|| anyhow!("No stored session found, pass --session"))
}

fn run_history(config: &Config, json: bool) -> Result<()> {
    let store = open_store(config);
    let session_id = resolve_session(config, store.as_ref())?;
    let transcript = TranscriptStore::load(store, &session_id);

    if json {
        println!("{}", serde_json::to_string_pretty(transcript.messages())?);
        return Ok(());
    }

    println!("Session {} ({} messages)", session_id, transcript.len());
    for entry in transcript.messages() {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

async fn run_clear(config: &Config) -> Result<()> {
    let store = open_store(config);
    let session_id = resolve_session(config, store.as_ref())?;

    let backend = BackendClient::new(config.base_url());
    match backend.clear_messages(&session_id).await {
        Ok(()) => println!("Cleared backend inbox for {}", session_id),
        Err(e) => eprintln!("Could not clear backend inbox: {}", e),
    }

    let mut transcript = TranscriptStore::load(store, &session_id);
    transcript.clear();
    println!("Cleared local transcript for {}", session_id);
    Ok(())
}

fn run_config(config: &Config, save: bool) -> Result<()> {
    let path = Config::get_config_path()?;
    if save {
        config.save()?;
        println!("Saved {}", path.display());
    } else {
        println!("# {}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

async fn run_branding(config: &Config, action: BrandingAction) -> Result<()> {
    let backend = BackendClient::new(config.base_url());
    let mut branding = backend.saas_config().await?;

    match action {
        BrandingAction::Show => {
            for (field, value) in branding.form_fields() {
                println!("{:<22} {}", field, value);
            }
        }
        BrandingAction::Set { field, value } => {
            branding.set_field(&field, &value)?;
            backend.save_saas_config(&branding).await?;
            println!("Saved {}", field);
        }
    }
    Ok(())
}
