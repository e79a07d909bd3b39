use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use chatloop_agent::{ConversationEvent, Engine};
use chatloop_core::config::Config;
use chatloop_core::message::{ConversationId, Role};
use chatloop_core::role::AgentRole;
use chatloop_core::store_jsonl::JsonlConversationStore;
use chatloop_providers::OpenAiTransport;
use chatloop_tools::{ToolContext, ToolRegistry};

mod chat;

#[derive(Parser)]
#[command(
    name = "chatloop",
    about = "Conversation engine with a bounded, approval-gated agent loop",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent (one-shot or interactive)
    Chat {
        /// Message to send (omit for interactive mode)
        #[arg(short, long)]
        message: Option<String>,

        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<ConversationId>,

        /// Start the conversation in the read-only planner role
        #[arg(long)]
        planner: bool,

        /// Model to use
        #[arg(long)]
        model: Option<String>,
    },

    /// Stored conversation management
    Conversations {
        #[command(subcommand)]
        action: ConversationAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConversationAction {
    /// List stored conversations
    List,
    /// Print the active branch of a conversation
    Show { id: ConversationId },
    /// Delete a conversation
    Delete { id: ConversationId },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    init_logging(&config, cli.verbose);

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid config {}:\n  {}", config_path.display(), errors.join("\n  "));
    }

    match cli.command {
        Commands::Chat {
            message,
            conversation,
            planner,
            model,
        } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let engine = build_engine(&config, model, tx);
            let id = match conversation {
                Some(id) => {
                    engine.open(id).await?;
                    if planner {
                        engine.set_role(id, AgentRole::Planner).await?;
                    }
                    id
                }
                None => {
                    let role = if planner { AgentRole::Planner } else { config.role() };
                    engine.create_with_role(role).await?
                }
            };
            tracing::info!(conversation_id = %id, "Conversation ready");

            let mut session = chat::ChatSession::new(engine, id, rx);
            match message {
                Some(text) => session.turn(text).await?,
                None => session.repl().await?,
            }
        }
        Commands::Conversations { action } => {
            let (tx, _rx) = mpsc::unbounded_channel();
            let engine = build_engine(&config, None, tx);
            match action {
                ConversationAction::List => {
                    let conversations = engine.list().await?;
                    if conversations.is_empty() {
                        println!("No conversations stored in {}", config.store_dir().display());
                    }
                    for meta in conversations {
                        println!(
                            "{}  {:<7}  {:>4} msgs  {}  {}",
                            meta.id,
                            meta.role,
                            meta.message_count,
                            meta.updated_at.format("%Y-%m-%d %H:%M"),
                            meta.title.as_deref().unwrap_or("(untitled)"),
                        );
                    }
                }
                ConversationAction::Show { id } => {
                    let snapshot = engine.open(id).await?;
                    println!(
                        "Conversation {} ({}, {} branches, state {})",
                        snapshot.id,
                        snapshot.role,
                        snapshot.branches.len(),
                        snapshot.state
                    );
                    for node in &snapshot.messages {
                        println!("\n[{}] {}", role_label(node.role), node.content.render());
                    }
                }
                ConversationAction::Delete { id } => {
                    engine.delete(id).await?;
                    println!("Deleted {id}");
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("config key '{key}' is not set"),
            },
        },
    }

    Ok(())
}

fn build_engine(
    config: &Config,
    model: Option<String>,
    events: mpsc::UnboundedSender<ConversationEvent>,
) -> Engine {
    let mut provider = config.provider.clone().unwrap_or_default();
    if model.is_some() {
        provider.model = model;
    }
    let transport = Arc::new(OpenAiTransport::from_config(&provider));
    let tools = Arc::new(ToolRegistry::with_builtins(
        ToolContext::from_config(config),
        &config.tools(),
    ));
    let store = Arc::new(JsonlConversationStore::new(config.store_dir()));

    Engine::builder(transport, tools)
        .config(config)
        .store(store)
        .workspace(config.workspace_dir())
        .events(events)
        .build()
}

/// Logs go to stderr so streamed replies on stdout stay clean.
fn init_logging(config: &Config, verbose: bool) {
    let logging = config.logging.clone().unwrap_or_default();
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.unwrap_or_else(|| "info".to_string())
    };

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    for directive in &logging.filters {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring log filter '{directive}': {e}"),
        }
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}
