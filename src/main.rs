mod cli;
mod command;
mod config;
mod db;
mod execute;
mod nlu;
mod offline;
mod resolve;
mod web;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use colored::Colorize;
use serde_json::Value;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, QueueAction};
use command::model::{CommandBody, ParsedCommand};
use config::settings::Config;
use db::{models::Worksite, Database, Schema};
use offline::{
    cache::Cache,
    queue::{EntryType, OfflineQueue},
    sync::{HttpReplayer, SyncManager},
};
use web::client::{ApiClient, ClientError};

const WORKSITES_CACHE_KEY: &str = "worksites";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cfg = config::settings::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Parse { transcript } => handle_parse(&cfg, &transcript.join(" ")).await?,
        Commands::Say {
            transcript,
            yes,
            offline,
            existing,
        } => handle_say(&cfg, &transcript.join(" "), yes, offline, existing).await?,
        Commands::Serve { port } => web::server::start_server(&cfg, port).await?,
        Commands::Queue { action } => handle_queue(&cfg, action).await?,
        Commands::Watch => handle_watch(&cfg).await?,
        Commands::Worksites { refresh } => handle_worksites(&cfg, refresh).await?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "sitelog=debug,tower_http=debug"
    } else {
        "sitelog=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_local(cfg: &Config) -> Result<Database> {
    Database::open(&cfg.local_path()?, Schema::Local)
}

async fn parse_command(cfg: &Config, transcript: &str) -> Result<ParsedCommand> {
    let service = nlu::client::from_config(&cfg.nlu)?;
    let today = chrono::Local::now().date_naive();
    Ok(nlu::extractor::parse_transcript(
        service.as_ref(),
        transcript,
        Duration::from_secs(cfg.nlu.timeout_secs),
        today,
    )
    .await)
}

async fn handle_parse(cfg: &Config, transcript: &str) -> Result<()> {
    println!();
    println!("  {} {}", "◉".cyan(), "Parsing...".dimmed());
    let parsed = parse_command(cfg, transcript).await?;
    print_parsed(&parsed, cfg.sync.min_confidence)?;
    Ok(())
}

async fn handle_say(
    cfg: &Config,
    transcript: &str,
    yes: bool,
    offline: bool,
    existing: bool,
) -> Result<()> {
    let mut parsed = parse_command(cfg, transcript).await?;
    if existing {
        if let CommandBody::CreateWorksite(draft) = &mut parsed.body {
            draft.is_existing = true;
        }
    }
    print_parsed(&parsed, cfg.sync.min_confidence)?;

    if parsed.confidence < cfg.sync.min_confidence && !yes {
        println!(
            "  {} {}\n",
            "●".yellow(),
            format!(
                "Confidence below {:.2}. Check the fields and re-run with --yes to send.",
                cfg.sync.min_confidence
            )
            .yellow()
        );
        return Ok(());
    }

    let payload = serde_json::to_value(parsed.to_request())?;
    let key = uuid::Uuid::new_v4().to_string();

    if offline {
        return enqueue_command(cfg, payload, key).await;
    }

    let client = ApiClient::new(&cfg.client)?;
    match client
        .post_json("/execute-dashboard-command", &payload, Some(&key))
        .await
    {
        Ok(body) => print_outcome(&body),
        Err(ClientError::Unreachable(err)) => {
            warn!("server unreachable, queueing command: {err}");
            enqueue_command(cfg, payload, key).await?;
        }
        Err(ClientError::Rejected { status, body }) => print_rejection(status.as_u16(), &body),
        Err(ClientError::Other(err)) => return Err(err),
    }
    Ok(())
}

async fn enqueue_command(cfg: &Config, payload: Value, key: String) -> Result<()> {
    let queue = OfflineQueue::new(open_local(cfg)?);
    let id = queue.enqueue_keyed(EntryType::Command, payload, key).await?;
    println!(
        "  {} {} {}\n",
        "⏸".yellow(),
        "Offline. Command queued as".yellow(),
        id.bold()
    );
    Ok(())
}

async fn handle_queue(cfg: &Config, action: QueueAction) -> Result<()> {
    let queue = OfflineQueue::new(open_local(cfg)?);

    match action {
        QueueAction::List { all } => {
            let entries = if all {
                queue.list_all().await?
            } else {
                queue.list_unsynced().await?
            };
            if entries.is_empty() {
                println!("\n  {} {}\n", "●".dimmed(), "Offline queue is empty.".dimmed());
                return Ok(());
            }
            print_header("Offline queue", &format!("{} entries", entries.len()));
            for entry in &entries {
                let ts = chrono::DateTime::from_timestamp_millis(entry.enqueued_at)
                    .map(|dt| dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "?".to_string());
                let state = if entry.synced {
                    "✓".green().to_string()
                } else {
                    "·".yellow().to_string()
                };
                println!(
                    "  {} {}  {:<8} {}  {}",
                    state,
                    ts.dimmed(),
                    entry.entry_type.as_str().cyan(),
                    entry.id.dimmed(),
                    truncate(&entry.payload.to_string(), 60)
                );
            }
            println!();
        }
        QueueAction::Sync => {
            let client = ApiClient::new(&cfg.client)?;
            let manager = SyncManager::new(queue, HttpReplayer::new(client));
            let report = manager.sync_all().await?;
            let failed = if report.failed_count > 0 {
                format!("{} failed", report.failed_count).red().to_string()
            } else {
                "0 failed".dimmed().to_string()
            };
            println!(
                "\n  {} {} synced, {}\n",
                "◉".cyan(),
                report.success_count.to_string().bold(),
                failed
            );
        }
        QueueAction::Purge { days } => {
            let cutoff = Utc::now().timestamp_millis() - i64::from(days) * 86_400_000;
            let removed = queue.purge_synced(cutoff).await?;
            println!(
                "\n  {} {}\n",
                "●".dimmed(),
                format!("Removed {removed} synced entries older than {days} days.").dimmed()
            );
        }
        QueueAction::Add {
            entry_type,
            payload,
        } => {
            let entry_type: EntryType = entry_type.parse()?;
            let payload: Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let id = queue.enqueue(entry_type, payload).await?;
            println!("\n  {} Queued {} entry {}\n", "✓".green(), entry_type.as_str(), id.bold());
        }
    }

    Ok(())
}

async fn handle_watch(cfg: &Config) -> Result<()> {
    let client = ApiClient::new(&cfg.client)?;
    let queue = OfflineQueue::new(open_local(cfg)?);
    let manager = SyncManager::new(queue, HttpReplayer::new(client.clone()));
    let interval = Duration::from_secs(cfg.sync.poll_interval_secs.max(1));

    println!(
        "\n  {} Watching {} every {}s. Ctrl-C to stop.\n",
        "◉".cyan(),
        client.base_url().bold(),
        interval.as_secs()
    );
    tokio::select! {
        _ = offline::sync::watch(&manager, &client, interval) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}

async fn handle_worksites(cfg: &Config, refresh: bool) -> Result<()> {
    let cache = Cache::new(open_local(cfg)?);
    let cached = if refresh {
        None
    } else {
        cache.get(WORKSITES_CACHE_KEY).await?
    };

    let (list, source) = match cached {
        Some(list) => (list, "cached"),
        None => {
            let client = ApiClient::new(&cfg.client)?;
            let body = client.get_json("/api/worksites").await?;
            let list = body["worksites"].clone();
            cache
                .put(
                    WORKSITES_CACHE_KEY,
                    &list,
                    Duration::from_secs(cfg.sync.cache_ttl_secs),
                )
                .await?;
            (list, "live")
        }
    };

    let worksites: Vec<Worksite> =
        serde_json::from_value(list).context("Unexpected worksite list from server")?;
    if worksites.is_empty() {
        println!("\n  {} {}\n", "●".dimmed(), "No worksites yet.".dimmed());
        return Ok(());
    }

    print_header("Worksites", &format!("{} {}", worksites.len(), source));
    for site in &worksites {
        println!(
            "  {} {}  {}  {}",
            "│".dimmed(),
            site.address.bold(),
            site.status.as_str().cyan(),
            site.id.dimmed()
        );
    }
    println!();
    Ok(())
}

// ─── Output helpers ─────────────────────────────────────────

fn print_header(title: &str, detail: &str) {
    println!();
    println!("  {} {}  {}", "◉".cyan(), title.bold(), detail.dimmed());
    println!("  {}", "─".repeat(60).dimmed());
}

fn print_parsed(parsed: &ParsedCommand, min_confidence: f64) -> Result<()> {
    let confidence = format!("{:.2}", parsed.confidence);
    let confidence = if parsed.confidence >= min_confidence {
        confidence.green()
    } else {
        confidence.yellow()
    };
    print_header(parsed.kind().as_str(), &format!("confidence {confidence}"));

    let fields = serde_json::to_value(&parsed.body)?;
    if let Value::Object(map) = fields {
        for (name, value) in map.iter().filter(|(name, _)| name.as_str() != "kind") {
            let shown = match value {
                Value::String(s) if s.is_empty() => "—".dimmed().to_string(),
                Value::String(s) => s.clone(),
                Value::Null => "—".dimmed().to_string(),
                other => other.to_string(),
            };
            println!("  {} {:<22} {}", "│".dimmed(), name.dimmed(), shown);
        }
    }
    for warning in &parsed.warnings {
        println!("  {} {}", "!".yellow(), warning.yellow());
    }
    println!("  {}", "─".repeat(60).dimmed());
    Ok(())
}

fn print_outcome(body: &Value) {
    if let Some(existing) = body.get("existingProject") {
        println!(
            "  {} {}",
            "⚠".yellow(),
            body["error"].as_str().unwrap_or("Worksite already exists").yellow()
        );
        println!(
            "  {}   {}  {}",
            "│".dimmed(),
            existing["address"].as_str().unwrap_or("?").bold(),
            existing["id"].as_str().unwrap_or("").dimmed()
        );
        println!(
            "  {}\n",
            "Re-run with --existing to record against this worksite.".dimmed()
        );
        return;
    }

    let created = ["project", "task", "timeEntry", "material", "receipt"]
        .into_iter()
        .find_map(|kind| body.get(kind).map(|record| (kind, record)));
    match created {
        Some(("project", record)) if body["reused"] == true => println!(
            "  {} Reusing worksite {}\n",
            "✓".green(),
            record["address"].as_str().unwrap_or("?").bold()
        ),
        Some((kind, record)) => println!(
            "  {} Created {} {}\n",
            "✓".green(),
            kind,
            record["id"].as_str().unwrap_or("?").dimmed()
        ),
        None => println!("  {} {}\n", "✓".green(), body),
    }
}

fn print_rejection(status: u16, body: &Value) {
    let message = body["error"].as_str().unwrap_or("request rejected");
    match status {
        401 => println!(
            "  {} {}\n",
            "✗".red(),
            "Not authorized. Set [client] api_token in the config.".red()
        ),
        404 => println!("  {} {}\n", "✗".red(), message.red()),
        _ => println!(
            "  {} {}\n",
            "✗".red(),
            format!("Server answered {status}: {message}").red()
        ),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}
