use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hrchat::config::Config;
use hrchat::conversation::{ChatController, ChatEvent, SaveStatus, TurnOutcome};
use hrchat::history::{parse_citations, HistoryApi, HistoryClient, Role};
use tokio::sync::mpsc;

const QUICK_QUESTIONS: &[&str] = &[
    "What is our training incentive policy?",
    "I got married, what do I need to do?",
    "I need to take a leave of absence, what should I do?",
    "Who is our medical provider?",
    "What does Guardian cover for me?",
    "What is our PTO Loan Policy?",
];

#[derive(Parser)]
#[command(name = "hrchat")]
#[command(about = "HR assistant chat client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: HRCHAT_CONFIG_PATH or ~/.hrchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat with the HR assistant (interactive). Ctrl-C stops the answer being generated.
    Chat {
        /// Config file path (default: HRCHAT_CONFIG_PATH or ~/.hrchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Existing conversation id to continue.
        #[arg(long, value_name = "ID")]
        conversation: Option<String>,
    },

    /// Manage stored conversations.
    History {
        /// Config file path (default: HRCHAT_CONFIG_PATH or ~/.hrchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[command(subcommand)]
        action: HistoryCommand,
    },

    /// Rate an assistant message.
    Feedback {
        /// Config file path (default: HRCHAT_CONFIG_PATH or ~/.hrchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        message_id: String,

        #[arg(value_parser = ["positive", "negative", "neutral"])]
        feedback: String,
    },

    /// Check whether chat history is available.
    Ensure {
        /// Config file path (default: HRCHAT_CONFIG_PATH or ~/.hrchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Show the signed-in identity.
    Whoami {
        /// Config file path (default: HRCHAT_CONFIG_PATH or ~/.hrchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Print the raw claim sets as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum HistoryCommand {
    /// List conversations, newest first.
    List {
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Print the conversations as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the messages of a conversation.
    Show { id: String },
    /// Change a conversation title.
    Rename { id: String, title: String },
    /// Delete a conversation.
    Delete { id: String },
    /// Remove every message of a conversation.
    Clear { id: String },
    /// Delete every conversation.
    DeleteAll {
        /// Required; there is no undo.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("hrchat {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            conversation,
        }) => {
            if let Err(e) = run_chat(config, conversation).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::History { config, action }) => {
            if let Err(e) = run_history(config, action).await {
                log::error!("history failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Feedback {
            config,
            message_id,
            feedback,
        }) => {
            if let Err(e) = run_feedback(config, &message_id, &feedback).await {
                log::error!("feedback failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Ensure { config }) => {
            if let Err(e) = run_ensure(config).await {
                log::error!("ensure failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Whoami { config, json }) => {
            if let Err(e) = run_whoami(config, json).await {
                log::error!("whoami failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(hrchat::config::default_config_path);
    let dir = hrchat::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

/// Load config and build a client for the configured (or HRCHAT_BASE_URL) backend.
fn load(config_path: Option<PathBuf>) -> anyhow::Result<(Config, HistoryClient)> {
    let (config, path) = hrchat::config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    let mut backend = config.backend.clone();
    backend.base_url = hrchat::config::resolve_base_url(&config);
    let client = HistoryClient::from_config(&backend)?;
    Ok((config, client))
}

fn connect(config_path: Option<PathBuf>) -> anyhow::Result<HistoryClient> {
    load(config_path).map(|(_, client)| client)
}

async fn run_chat(
    config_path: Option<PathBuf>,
    conversation: Option<String>,
) -> anyhow::Result<()> {
    let (config, client) = load(config_path)?;
    if config.speech.avatar_enabled || config.speech.speech_to_speech {
        log::warn!(
            "speech settings ignored: the terminal has no speech recognizer or avatar to drive"
        );
    }

    let settings = client.frontend_settings().await.unwrap_or_else(|e| {
        log::warn!("could not read frontend settings: {}", e);
        Default::default()
    });
    let identity = hrchat::auth::fetch_identity(&client).await;
    if settings.auth_enabled
        && identity.needs_auth_setup(hrchat::config::is_loopback_url(client.base_url()))
    {
        eprintln!("Authentication not configured. Add an identity provider to the deployment and try again.");
        return Ok(());
    }
    let user = identity.user();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut controller = ChatController::new(Arc::new(client))
        .with_events(tx)
        .with_user(user.clone());

    let health = controller.check_history().await;
    if !controller.history_available() {
        eprintln!("Chat history is not enabled: {}", health.status);
    }
    if let Some(id) = conversation {
        controller.refresh_history().await?;
        controller.load_conversation(&id).await?;
        print_transcript(controller.messages());
    } else {
        println!("{}", user.greeting());
        println!("Try asking:");
        for q in QUICK_QUESTIONS {
            println!("  - {}", q);
        }
    }

    let canceller = controller.canceller();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if canceller.cancel_all() == 0 {
                std::process::exit(130);
            }
        }
    });

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        match input {
            "/exit" | "/quit" => break,
            "/new" => {
                controller.new_chat();
                println!("{}", user.greeting());
                continue;
            }
            "/clear" => {
                if let Err(e) = controller.clear_chat().await {
                    eprintln!("could not clear chat: {}", e);
                }
                continue;
            }
            "/history" => {
                match controller.refresh_history().await {
                    Ok(conversations) => {
                        for c in conversations {
                            println!("{}  {}  {}", c.id, c.date, c.title);
                        }
                    }
                    Err(e) => eprintln!("could not list history: {}", e),
                }
                continue;
            }
            _ => {}
        }
        if let Some(id) = input.strip_prefix("/open ") {
            match controller.load_conversation(id.trim()).await {
                Ok(()) => print_transcript(controller.messages()),
                Err(e) => eprintln!("could not open conversation: {}", e),
            }
            continue;
        }
        if let Some(value) = input.strip_prefix("/feedback ") {
            if !settings.feedback_enabled {
                eprintln!("feedback is not enabled for this deployment");
                continue;
            }
            let last = controller
                .messages()
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .map(|m| m.id.clone());
            match last {
                Some(id) => {
                    if let Err(e) = controller.set_feedback(&id, value.trim()).await {
                        eprintln!("could not send feedback: {}", e);
                    }
                }
                None => eprintln!("no answer to rate yet"),
            }
            continue;
        }

        let turn = controller.begin_turn(input);
        let run = turn.run();
        tokio::pin!(run);
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(event) = rx.recv() => print_event(&event),
            }
        };
        while let Ok(event) = rx.try_recv() {
            print_event(&event);
        }
        let outcome = controller.finish(result).await;
        while let Ok(event) = rx.try_recv() {
            print_event(&event);
        }
        report(&controller, &outcome);
    }

    Ok(())
}

fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::AssistantDelta { delta, .. } => {
            print!("{}", delta);
            let _ = io::stdout().flush();
        }
        ChatEvent::LoadingFinished { .. } => println!(),
        other => log::debug!("{:?}", other),
    }
}

fn report(controller: &ChatController, outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Answered { saved, .. } => {
            let tool = controller
                .messages()
                .iter()
                .rev()
                .take_while(|m| m.role != Role::User)
                .find(|m| m.role == Role::Tool);
            if let Some(tool) = tool {
                for (i, c) in parse_citations(tool).iter().enumerate() {
                    let title = c.title.as_deref().or(c.filepath.as_deref()).unwrap_or(&c.id);
                    println!("  [{}] {}", i + 1, title);
                }
            }
            for r in controller.exec_results() {
                log::info!("intent: {}", r.intent);
            }
            if *saved == SaveStatus::Failed {
                eprintln!("{}", hrchat::error::PERSISTENCE_ERROR_TEXT);
            }
        }
        TurnOutcome::Failed { message, .. } => eprintln!("{}", message),
        TurnOutcome::Cancelled => println!("(stopped)"),
        TurnOutcome::Stale => {}
    }
}

fn print_transcript(messages: &[hrchat::history::ChatMessage]) {
    for m in messages {
        match m.role {
            Role::User => println!("> {}", m.content),
            Role::Assistant => println!("{}", m.content),
            Role::Error => eprintln!("{}", m.content),
            Role::Tool => {}
        }
    }
}

async fn run_history(config_path: Option<PathBuf>, action: HistoryCommand) -> anyhow::Result<()> {
    let client = connect(config_path)?;
    match action {
        HistoryCommand::List { offset, json } => {
            let conversations = client.list(offset).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&conversations)?);
            } else {
                for c in &conversations {
                    println!("{}  {}  {} ({} messages)", c.id, c.date, c.title, c.messages.len());
                }
            }
        }
        HistoryCommand::Show { id } => {
            let messages = client.read(&id).await?;
            print_transcript(&messages);
        }
        HistoryCommand::Rename { id, title } => {
            client.rename(&id, &title).await?;
            println!("renamed {}", id);
        }
        HistoryCommand::Delete { id } => {
            client.delete(&id).await?;
            println!("deleted {}", id);
        }
        HistoryCommand::Clear { id } => {
            client.clear(&id).await?;
            println!("cleared {}", id);
        }
        HistoryCommand::DeleteAll { yes } => {
            if !yes {
                anyhow::bail!("refusing to delete all conversations without --yes");
            }
            client.delete_all().await?;
            println!("deleted all conversations");
        }
    }
    Ok(())
}

async fn run_feedback(
    config_path: Option<PathBuf>,
    message_id: &str,
    feedback: &str,
) -> anyhow::Result<()> {
    let client = connect(config_path)?;
    client.message_feedback(message_id, feedback).await?;
    println!("recorded {} feedback for {}", feedback, message_id);
    Ok(())
}

async fn run_ensure(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let client = connect(config_path)?;
    let health = client.ensure().await;
    println!("{}", health.status);
    if !health.available {
        std::process::exit(2);
    }
    Ok(())
}

async fn run_whoami(config_path: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let client = connect(config_path)?;
    let identity = hrchat::auth::fetch_identity(&client).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&identity.claims)?);
        return Ok(());
    }
    let user = identity.user();
    println!("{}", user.fullname);
    println!("email: {}", user.email);
    println!("username: {}", user.preferred_username);
    if identity.is_guest {
        println!("(guest: identity provider unreachable)");
    }
    Ok(())
}
