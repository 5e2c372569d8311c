//! labelq CLI: operator interface to the labeling queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use labelq::config::Config;
use labelq::lifecycle::LeaseScope;
use labelq::maintenance::{self, ExportOptions};
use labelq::model::{ItemFilter, ItemId, ItemState, Labels, LeaseToken, Payload};
use labelq::telemetry::{TelemetryConfig, init_telemetry};
use labelq::{Engine, Error};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

#[derive(Parser)]
#[command(name = "labelq", about = "Lease-based work assignment for image labeling")]
struct Cli {
    /// TOML config file; environment variables override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register new images from the image directory
    Sync,
    /// Reserve the next item and print its lease
    Next,
    /// Finish a leased item with labels
    Label {
        id: ItemId,
        token: String,
        /// JSON object: category -> list of labels
        labels: String,
    },
    /// Finish a leased item without labels
    Skip { id: ItemId, token: String },
    /// List items
    List {
        /// Filter by state (pending, in_progress, done)
        #[arg(long)]
        state: Option<ItemState>,
        /// Maximum items to show (0 = all)
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    /// Show one item
    Show { id: ItemId },
    /// Item counts per state
    Stats,
    /// Return every in-progress item to pending
    Release,
    /// Write finished labels as sidecar JSON files next to the images
    Export {
        /// Keep sidecar files that already exist
        #[arg(long)]
        skip_existing: bool,
    },
    /// Rename a label value in every stored payload
    RenameLabel { old: String, new: String },
    /// Serve JSON requests on stdin, one per line, until EOF or Ctrl-C
    Session,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "labelq"))?;
    let engine = Engine::open(config)?;

    match cli.command {
        Command::Sync => cmd_sync(&engine),
        Command::Next => cmd_next(&engine),
        Command::Label { id, token, labels } => cmd_label(&engine, id, token, &labels),
        Command::Skip { id, token } => {
            engine.skip(id, &LeaseToken::from(token))?;
            println!("Skipped {id}");
            Ok(())
        }
        Command::List { state, limit } => cmd_list(&engine, state, limit),
        Command::Show { id } => cmd_show(&engine, id),
        Command::Stats => cmd_stats(&engine),
        Command::Release => {
            let released = engine.release_all_leases()?;
            println!("Released {released} lease(s).");
            Ok(())
        }
        Command::Export { skip_existing } => {
            let report = maintenance::export_labels(
                engine.storage(),
                &engine.config().image_directory,
                ExportOptions {
                    overwrite: !skip_existing,
                },
            )?;
            if report.skipped > 0 {
                println!(
                    "Wrote {} file(s). Skipped {} row(s).",
                    report.exported, report.skipped
                );
            } else {
                println!("Wrote {} file(s).", report.exported);
            }
            Ok(())
        }
        Command::RenameLabel { old, new } => {
            let updated = maintenance::rename_label(engine.storage(), &old, &new, Utc::now())?;
            println!("Updated {updated} row(s).");
            Ok(())
        }
        Command::Session => cmd_session(Arc::new(engine)).await,
    }
}

fn cmd_sync(engine: &Engine) -> anyhow::Result<()> {
    let report = engine.sync_catalog()?;
    println!(
        "Scanned {} image(s), registered {} new.",
        report.scanned, report.registered
    );
    Ok(())
}

fn cmd_next(engine: &Engine) -> anyhow::Result<()> {
    match engine.reserve_next()? {
        Some(r) => {
            println!("ID:     {}", r.id);
            println!("File:   {}", r.source_ref);
            println!("Token:  {}", r.token);
        }
        None => println!("No items available."),
    }
    Ok(())
}

fn cmd_label(engine: &Engine, id: ItemId, token: String, labels: &str) -> anyhow::Result<()> {
    let labels: Labels = serde_json::from_str(labels).context("labels must be a JSON object of lists")?;
    if !labels.has_selection() {
        anyhow::bail!("at least one label must be selected to submit");
    }
    engine.finalize(id, &LeaseToken::from(token), labels)?;
    println!("Labeled {id}");
    Ok(())
}

fn cmd_list(engine: &Engine, state: Option<ItemState>, limit: usize) -> anyhow::Result<()> {
    let items = engine.list_items(ItemFilter { state, limit: Some(limit) })?;

    if items.is_empty() {
        println!("No items found.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<32}  {:<11}  {:<7}  UPDATED",
        "ID", "FILE", "STATE", "SKIPPED"
    );
    println!("{}", "-".repeat(80));

    for item in &items {
        let file: String = item.source_ref.chars().take(32).collect();
        println!(
            "{:<6}  {:<32}  {:<11}  {:<7}  {}",
            item.id,
            file,
            item.state,
            if item.skipped { "yes" } else { "" },
            item.updated_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

fn cmd_show(engine: &Engine, id: ItemId) -> anyhow::Result<()> {
    let item = engine.get(id)?;

    println!("ID:       {}", item.id);
    println!("File:     {}", item.source_ref);
    println!("State:    {}", item.state);
    println!("Skipped:  {}", item.skipped);
    if let Some(ref lease) = item.lease {
        println!("Token:    {}", lease.token);
        println!("Leased:   {}", lease.granted_at);
    }
    if let Some(updated) = item.updated_at {
        println!("Updated:  {updated}");
    }
    match item.payload {
        Some(Payload::Labels(labels)) => {
            println!("Labels:   {}", serde_json::to_string_pretty(&labels)?)
        }
        Some(Payload::Raw(raw)) => println!("Labels:   {raw} (unparsed)"),
        None => {}
    }
    Ok(())
}

fn cmd_stats(engine: &Engine) -> anyhow::Result<()> {
    let counts = engine.counts()?;
    println!("Pending:      {}", counts.pending);
    println!("In progress:  {}", counts.in_progress);
    println!("Done:         {} ({} skipped)", counts.done, counts.skipped);
    println!("Total:        {}", counts.total());
    Ok(())
}

// ---------------------------------------------------------------------------
// Session host
// ---------------------------------------------------------------------------

/// One request line of the session protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Next,
    Label {
        id: ItemId,
        token: String,
        labels: Labels,
    },
    Skip {
        id: ItemId,
        token: String,
    },
    List {
        state: Option<ItemState>,
        limit: Option<usize>,
    },
    Stats,
    Config,
}

async fn cmd_session(engine: Arc<Engine>) -> anyhow::Result<()> {
    let scope = tokio::task::spawn_blocking(move || LeaseScope::begin(engine)).await??;
    let engine = scope.engine().clone();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(engine.clone(), &line).await;
                stdout.write_all(format!("{response}\n").as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = &mut shutdown => {
                tracing::info!("interrupted, shutting down session");
                break;
            }
        }
    }

    tokio::task::spawn_blocking(move || scope.finish()).await??;
    Ok(())
}

async fn handle_line(engine: Arc<Engine>, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return json!({"status": "invalid", "message": e.to_string()}),
    };
    match tokio::task::spawn_blocking(move || dispatch(&engine, request)).await {
        Ok(response) => response,
        Err(e) => json!({"status": "error", "message": e.to_string()}),
    }
}

fn dispatch(engine: &Engine, request: Request) -> Value {
    let result = match request {
        Request::Next => engine.reserve_next().map(|reserved| match reserved {
            Some(r) => json!({
                "status": "ok",
                "item": {"id": r.id, "filename": r.source_ref},
                "reservation_token": r.token,
            }),
            None => json!({"status": "empty"}),
        }),
        Request::Label { id, token, labels } => {
            if !labels.has_selection() {
                return json!({
                    "status": "invalid",
                    "message": "At least one label must be selected to submit.",
                });
            }
            engine
                .finalize(id, &LeaseToken::from(token), labels)
                .map(|()| json!({"status": "ok"}))
        }
        Request::Skip { id, token } => engine
            .skip(id, &LeaseToken::from(token))
            .map(|()| json!({"status": "ok"})),
        Request::List { state, limit } => engine
            .list_items(ItemFilter { state, limit })
            .map(|records| json!({"status": "ok", "records": records})),
        Request::Stats => engine
            .counts()
            .map(|counts| json!({"status": "ok", "counts": counts})),
        Request::Config => Ok(json!({
            "status": "ok",
            "categories": engine.categories(),
            "image_directory": engine.config().image_directory,
        })),
    };

    result.unwrap_or_else(|e| error_response(&e))
}

fn error_response(e: &Error) -> Value {
    let status = match e {
        Error::ReservationMismatch(_) => "conflict",
        Error::NotFound(_) => "not_found",
        _ => "error",
    };
    let message = match e {
        Error::ReservationMismatch(_) => "Reservation mismatch. Reload to get a new image.".to_string(),
        Error::NotFound(_) => "Image not found".to_string(),
        other => {
            tracing::error!(error = %other, "request failed");
            "Internal server error".to_string()
        }
    };
    json!({"status": status, "message": message})
}
