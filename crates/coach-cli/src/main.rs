// ============================================================================
// coach - command line front end for the coach memory subsystem
// ============================================================================
// Usage:
//   coach chat --user ID                     Interactive chat on stdin
//   coach ask --user ID MESSAGE              Process a single turn
//   coach history --user ID [--since DATE]   Show logged turns
//   coach profile show --user ID             Show a user's profile
//   coach profile set --user ID key=value    Update profile fields
//   coach recall --user ID --query TEXT      Show memories relevant to a query
//   coach stats                              Show database statistics
//   coach export --user ID                   Export profile and turns as JSON
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use coach_core::memory::{ContextAssembler, ResilientEmbedder};
use coach_core::{
    CoachConfig, CoachDb, ConversationTurn, MemoryBackends, MemoryCategory, MemoryCoordinator,
    OpenAiChatModel, ProfilePatch, StorageBackend,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Nutrition coach memory tool
#[derive(Parser)]
#[command(name = "coach", version, about = "Chat with the coach and inspect its memory")]
struct Cli {
    /// Path to the database file (default: ~/.coach/memory.redb)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat session, one message per line
    Chat {
        #[arg(long)]
        user: String,
    },

    /// Process a single message and print the reply
    Ask {
        #[arg(long)]
        user: String,

        message: String,

        /// Also print retrieval and persistence details
        #[arg(long)]
        verbose: bool,
    },

    /// Show logged turns for a user, oldest first
    History {
        #[arg(long)]
        user: String,

        /// Only turns at or after this date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        since: Option<String>,

        /// Show at most this many of the most recent turns
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show or update a user profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Show stored memories relevant to a query
    Recall {
        #[arg(long)]
        user: String,

        #[arg(long)]
        query: String,

        #[arg(long, default_value = "3")]
        k: usize,

        /// Restrict to one category: meal_log, goal_check, advice, mood, casual
        #[arg(long)]
        category: Option<String>,
    },

    /// Show database statistics (profiles, turns per category)
    Stats,

    /// Export a user's profile and turn log as JSON
    Export {
        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    Show {
        #[arg(long)]
        user: String,
    },
    /// Set fields, e.g. `weight=72.5 goals="build muscle,sleep more"`
    Set {
        #[arg(long)]
        user: String,

        #[arg(required = true)]
        fields: Vec<String>,
    },
}

fn parse_since(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}'. Use YYYY-MM-DD or RFC 3339", s))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .with_context(|| format!("Invalid date '{}'", s))?;
    Ok(midnight.and_utc())
}

fn parse_category(raw: Option<&str>) -> Result<Option<MemoryCategory>> {
    let category = raw.map(str::parse::<MemoryCategory>).transpose()?;
    Ok(category)
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn print_turn(turn: &ConversationTurn) {
    println!(
        "[{}] ({})",
        format_timestamp(&turn.timestamp),
        turn.memory_type.display_name()
    );
    println!("  user:  {}", turn.message);
    println!("  coach: {}", turn.response);
}

fn load_config(db_path: Option<PathBuf>) -> Result<CoachConfig> {
    let mut config = CoachConfig::from_env().context("Invalid configuration")?;
    if db_path.is_some() {
        config.db_path = db_path;
    }
    Ok(config)
}

/// The redb file can only be opened once per process, so inspection
/// commands go through `CoachDb` directly.
fn open_db(config: &CoachConfig) -> Result<CoachDb> {
    if config.storage != StorageBackend::Redb {
        anyhow::bail!("This command needs COACH_STORAGE=redb");
    }
    CoachDb::open(config.db_path.as_deref()).context("Failed to open coach database")
}

fn build_coordinator(config: &CoachConfig) -> Result<MemoryCoordinator> {
    let api_key = config
        .openai_api_key
        .clone()
        .context("OPENAI_API_KEY is required to chat")?;
    let model = OpenAiChatModel::new(
        api_key,
        &config.llm_base_url,
        &config.llm_model,
        std::time::Duration::from_millis(config.llm_timeout_ms),
    )?;
    let coordinator = MemoryCoordinator::from_config(config, Arc::new(model))
        .context("Failed to initialize memory backends")?;
    Ok(coordinator)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coach_core=info,coach_cli=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.db_path)?;

    match cli.command {
        Commands::Chat { user } => cmd_chat(&config, &user).await,
        Commands::Ask {
            user,
            message,
            verbose,
        } => cmd_ask(&config, &user, &message, verbose).await,
        Commands::History { user, since, limit } => cmd_history(&config, &user, since, limit),
        Commands::Profile { action } => match action {
            ProfileAction::Show { user } => cmd_profile_show(&config, &user),
            ProfileAction::Set { user, fields } => cmd_profile_set(&config, &user, &fields),
        },
        Commands::Recall {
            user,
            query,
            k,
            category,
        } => cmd_recall(&config, &user, &query, k, category).await,
        Commands::Stats => cmd_stats(&config),
        Commands::Export { user } => cmd_export(&config, &user),
    }
}

async fn cmd_chat(config: &CoachConfig, user: &str) -> Result<()> {
    let coordinator = build_coordinator(config)?;
    info!("Chat session for {} (Ctrl-D to quit)", user);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "/quit" || message == "/exit" {
            break;
        }

        let reply = coordinator.process_turn(user, message).await;
        println!("{}\n", reply);
    }

    let flushed = coordinator.flush().await;
    info!("Flushed {} pending memory writes", flushed);
    Ok(())
}

async fn cmd_ask(config: &CoachConfig, user: &str, message: &str, verbose: bool) -> Result<()> {
    let coordinator = build_coordinator(config)?;
    let outcome = coordinator.process_turn_detailed(user, message).await;
    coordinator.flush().await;

    println!("{}", outcome.response);
    if verbose {
        println!();
        println!("retrieval: {}", outcome.retrieval.as_str());
        if let Some(turn) = &outcome.turn {
            println!("category:  {}", turn.memory_type);
        }
        if let Some(report) = &outcome.persisted {
            println!("logged:    {}", report.logged);
            println!("indexed:   {:?}", report.index);
        }
        println!("degraded:  {}", outcome.degraded);
    }
    Ok(())
}

fn cmd_history(
    config: &CoachConfig,
    user: &str,
    since: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    let db = open_db(config)?;
    let since = since.as_deref().map(parse_since).transpose()?;

    let mut turns = db.query_turns(user, since)?;
    if let Some(limit) = limit {
        let skip = turns.len().saturating_sub(limit);
        turns.drain(..skip);
    }

    if turns.is_empty() {
        println!("No turns found for {}.", user);
        return Ok(());
    }
    for turn in &turns {
        print_turn(turn);
    }
    println!();
    println!("{} turn(s)", turns.len());
    Ok(())
}

fn cmd_profile_show(config: &CoachConfig, user: &str) -> Result<()> {
    let db = open_db(config)?;
    match db.get_profile(user)? {
        Some(profile) => {
            println!("=== Profile: {} ===", profile.user_id);
            println!("{}", profile.summary());
            println!();
            println!("Created:          {}", format_timestamp(&profile.created_at));
            println!("Last interaction: {}", format_timestamp(&profile.last_interaction));
        }
        None => println!("No profile for {}.", user),
    }
    Ok(())
}

fn cmd_profile_set(config: &CoachConfig, user: &str, fields: &[String]) -> Result<()> {
    let patch = ProfilePatch::from_pairs(fields)?;

    let db = open_db(config)?;
    let profile = db.upsert_profile(user, &patch, Utc::now())?;
    println!("Updated profile for {}:", profile.user_id);
    println!("{}", profile.summary());
    Ok(())
}

async fn cmd_recall(
    config: &CoachConfig,
    user: &str,
    query: &str,
    k: usize,
    category: Option<String>,
) -> Result<()> {
    let category = parse_category(category.as_deref())?;

    let backends = MemoryBackends::from_config(config).context("Failed to initialize memory backends")?;
    let embedder = ResilientEmbedder::new(backends.embedder.clone(), config.backend_retry());
    let assembler = ContextAssembler::new(
        backends.profiles,
        backends.turn_log,
        backends.index,
        embedder,
        config.backend_retry(),
    )
    .with_fallback_candidates(config.fallback_candidates);

    let (memories, source) = assembler.recall(user, query, k, category).await;
    if memories.is_empty() {
        println!("No memories found (retrieval: {}).", source.as_str());
        return Ok(());
    }

    println!("{:<8}  {:<22}  {:<12}  {}", "SCORE", "WHEN", "CATEGORY", "TEXT");
    println!("{}", "-".repeat(90));
    for memory in &memories {
        let text: String = memory.text.replace('\n', " ").chars().take(60).collect();
        println!(
            "{:<8.3}  {:<22}  {:<12}  {}",
            memory.score,
            memory.timestamp.format("%Y-%m-%d %H:%M"),
            memory.memory_type.as_str(),
            text
        );
    }
    println!();
    println!("retrieval: {}", source.as_str());
    Ok(())
}

fn cmd_stats(config: &CoachConfig) -> Result<()> {
    let db = open_db(config)?;
    let stats = db.stats()?;

    println!("=== Coach Memory Stats ===");
    println!("Database: {}", db.path().display());
    println!();
    println!("Profiles: {}", stats.total_profiles);
    println!(
        "Turns:    {} total across {} user(s)",
        stats.total_turns, stats.users_with_turns
    );
    for (category, count) in &stats.turn_counts {
        println!("  {:12} {}", category, count);
    }
    Ok(())
}

fn cmd_export(config: &CoachConfig, user: &str) -> Result<()> {
    let db = open_db(config)?;
    let profile = db.get_profile(user)?;
    let turns = db.query_turns(user, None)?;

    let export = serde_json::json!({
        "user_id": user,
        "profile": profile,
        "turns": turns,
        "exported_at": Utc::now().to_rfc3339(),
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
