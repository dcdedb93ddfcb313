use std::io::Read;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use mnemo_lib::config::SyncMode;
use mnemo_lib::sync::scheduler::MIN_INTERVAL_SECS;
use mnemo_lib::sync::{
    start_sync_scheduler, ChangeKind, EntityComparison, EntitySummary, MergeStrategy, Resolution, SyncOutcome,
    SyncTrigger,
};

use crate::app::App;
use crate::OutputFormat;

pub async fn sync(app: &App, force: bool, format: &OutputFormat) -> Result<()> {
    let manager = app.sync_manager()?;
    let outcome = manager.sync(SyncTrigger::Manual, force).await;
    report(&outcome, format)
}

pub async fn push(app: &App, format: &OutputFormat) -> Result<()> {
    let manager = app.sync_manager()?;
    report(&manager.force_push().await, format)
}

pub async fn fetch(app: &App, format: &OutputFormat) -> Result<()> {
    let manager = app.sync_manager()?;
    report(&manager.force_fetch().await, format)
}

pub async fn revert_fetch(app: &App, format: &OutputFormat) -> Result<()> {
    let manager = app.sync_manager()?;
    report(&manager.revert_last_fetch().await, format)
}

/// Sync, and when both sides changed apply the given choices.
///
/// The pending merge lives only as long as the manager, so detection and
/// resolution run back to back here.
pub async fn resolve(app: &App, remote: &[String], all_remote: bool, format: &OutputFormat) -> Result<()> {
    let manager = app.sync_manager()?;
    let comparisons = match manager.sync(SyncTrigger::Manual, false).await {
        SyncOutcome::NeedsResolution(comparisons) => comparisons,
        other => {
            if matches!(format, OutputFormat::Plain) && !other.is_failure() {
                println!("Nothing to resolve.");
            }
            return report(&other, format);
        }
    };

    let strategy = if all_remote {
        MergeStrategy::prefer_remote(comparisons.iter().map(|c| c.id.clone()))
    } else {
        let mut ids = Vec::new();
        for pattern in remote {
            ids.push(match_comparison(&comparisons, pattern)?.id.clone());
        }
        MergeStrategy::prefer_remote(ids)
    };

    if matches!(format, OutputFormat::Plain) {
        for comparison in comparisons.iter().filter(|c| c.needs_choice()) {
            let side = match strategy.resolution_for(&comparison.id) {
                Resolution::Local => "local",
                Resolution::Remote => "remote",
            };
            println!("  {} -> {}", comparison.name(), side);
        }
    }

    report(&manager.resolve_merge(&strategy).await, format)
}

/// Run periodic automatic syncs until interrupted
pub async fn watch(app: &App) -> Result<()> {
    let settings = &app.config.sync;
    if !settings.enabled {
        bail!("Sync is off; set `enabled = true` under [sync] in config.toml");
    }
    if settings.mode != SyncMode::Periodic {
        log::info!("Sync mode is manual; watching anyway");
    }

    let manager = Arc::new(app.sync_manager()?);
    let scheduler = start_sync_scheduler(manager, settings.interval_secs);
    println!(
        "Syncing every {}s, press Ctrl-C to stop.",
        settings.interval_secs.max(MIN_INTERVAL_SECS)
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    scheduler.shutdown();
    scheduler.join().await;
    Ok(())
}

pub async fn remote_backups(app: &App, format: &OutputFormat) -> Result<()> {
    let manager = app.sync_manager()?;
    let backups = manager
        .list_remote_backups()
        .await
        .context("Failed to list remote backups")?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&backups)?);
        }
        OutputFormat::Plain => {
            if backups.is_empty() {
                println!("No remote backups.");
                return Ok(());
            }
            let name_width = backups.iter().map(|b| b.name.len()).max().unwrap_or(4).max(4);
            println!("{:<nw$} {:>10} {}", "Name", "Size", "Modified", nw = name_width);
            for backup in &backups {
                println!(
                    "{:<nw$} {:>10} {}",
                    backup.name,
                    backup.size,
                    backup.modified.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
                    nw = name_width
                );
            }
        }
    }

    Ok(())
}

pub async fn restore_remote(app: &App, name: &str, format: &OutputFormat) -> Result<()> {
    let manager = app.sync_manager()?;
    report(&manager.restore_remote_backup(name).await, format)
}

pub async fn delete_remote(app: &App, name: &str) -> Result<()> {
    let manager = app.sync_manager()?;
    let deleted = manager
        .delete_remote_backup(name)
        .await
        .with_context(|| format!("Failed to delete {}", name))?;
    if deleted {
        println!("Deleted {}", name);
    } else {
        println!("Cancelled.");
    }
    Ok(())
}

/// Store the API key; "-" reads it from stdin
pub fn set_key(app: &App, key: &str) -> Result<()> {
    let key = if key == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read the key from stdin")?;
        buf.trim().to_string()
    } else {
        key.to_string()
    };
    if key.is_empty() {
        bail!("The API key is empty");
    }

    let app_id = &app.config.sync.app_id;
    app.credentials
        .store_api_key(app_id, &key)
        .context("Failed to store the API key")?;
    println!("API key stored for {}", app_id);
    Ok(())
}

/// Print an outcome; failures become the command's error
pub fn report(outcome: &SyncOutcome, format: &OutputFormat) -> Result<()> {
    if let SyncOutcome::Failed { kind, message } = outcome {
        bail!("{} ({:?})", message, kind);
    }

    match format {
        OutputFormat::Json => {
            let comparisons = match outcome {
                SyncOutcome::NeedsResolution(comparisons) => Some(comparisons),
                _ => None,
            };
            let output = serde_json::json!({
                "outcome": outcome_name(outcome),
                "message": outcome.to_string(),
                "comparisons": comparisons,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            println!("{}", outcome);
            if let SyncOutcome::NeedsResolution(comparisons) = outcome {
                print_comparisons(comparisons);
                println!();
                println!("Run `mnemo-cli resolve --remote <name>` for each item to take from the remote,");
                println!("or `mnemo-cli resolve` to keep every local copy.");
            }
        }
    }

    Ok(())
}

fn outcome_name(outcome: &SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::UpToDate => "upToDate",
        SyncOutcome::Pushed => "pushed",
        SyncOutcome::Pulled => "pulled",
        SyncOutcome::Merged => "merged",
        SyncOutcome::Reverted => "reverted",
        SyncOutcome::Reset => "reset",
        SyncOutcome::NeedsResolution(_) => "needsResolution",
        SyncOutcome::Skipped(_) => "skipped",
        SyncOutcome::AlreadySyncing => "alreadySyncing",
        SyncOutcome::Declined => "declined",
        SyncOutcome::Failed { .. } => "failed",
    }
}

fn print_comparisons(comparisons: &[EntityComparison]) {
    for comparison in comparisons {
        let change = match comparison.change {
            ChangeKind::Changed => "changed on both",
            ChangeKind::LocalOnly => "only here",
            ChangeKind::RemoteOnly => "only on remote",
            ChangeKind::Unchanged => continue,
        };
        println!("  {} [{:?}, {}]", comparison.name(), comparison.kind, change);
        if let Some(local) = &comparison.local {
            println!("    local:  {}", summary_line(local));
        }
        if let Some(remote) = &comparison.remote {
            println!("    remote: {}", summary_line(remote));
        }
    }
}

fn summary_line(summary: &EntitySummary) -> String {
    let deleted = if summary.deleted { ", deleted" } else { "" };
    format!(
        "{} items, {} due, {:.0}% mastery, modified {}{}",
        summary.item_count,
        summary.due_count,
        summary.average_mastery * 100.0,
        summary.last_modified.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
        deleted
    )
}

/// Find a changed entity by id, or by case-insensitive name prefix
fn match_comparison<'a>(comparisons: &'a [EntityComparison], pattern: &str) -> Result<&'a EntityComparison> {
    if let Some(found) = comparisons.iter().find(|c| c.id == pattern) {
        return Ok(found);
    }

    let pattern_lower = pattern.to_lowercase();
    let matches: Vec<&EntityComparison> = comparisons
        .iter()
        .filter(|c| c.change != ChangeKind::Unchanged)
        .filter(|c| c.name().to_lowercase().starts_with(&pattern_lower))
        .collect();

    match matches.len() {
        0 => bail!("Nothing changed matches '{}'", pattern),
        1 => Ok(matches[0]),
        _ => bail!(
            "Ambiguous name '{}'. Matches:\n{}",
            pattern,
            matches
                .iter()
                .map(|c| format!("  - {} ({})", c.name(), c.id))
                .collect::<Vec<_>>()
                .join("\n")
        ),
    }
}
