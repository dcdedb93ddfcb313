use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

use mnemo_lib::storage::parse_backup;
use mnemo_lib::sync::DestructiveAction;

use crate::app::App;
use crate::OutputFormat;

pub fn purge(app: &App, format: &OutputFormat) -> Result<()> {
    let retention = app.config.storage.retention();
    let report = app
        .store
        .purge_deleted(retention, Utc::now())
        .context("Failed to purge deleted data")?;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "decks": report.decks,
                "series": report.series,
                "reviews": report.reviews,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            if report.is_empty() {
                println!("Nothing deleted more than {} days ago.", app.config.storage.purge_after_days);
            } else {
                println!(
                    "Purged {} deck(s), {} series and {} review log(s).",
                    report.decks, report.series, report.reviews
                );
            }
        }
    }

    Ok(())
}

pub fn import(app: &App, file: &Path) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let snapshot = parse_backup(&bytes).with_context(|| format!("{} is not a valid backup", file.display()))?;

    if !app.confirm(DestructiveAction::ImportBackup) {
        println!("Cancelled.");
        return Ok(());
    }

    app.store
        .atomic_restore(&snapshot)
        .context("Failed to restore the backup")?;
    println!(
        "Imported {} deck(s), {} series and {} review log(s).",
        snapshot.decks.len(),
        snapshot.deck_series.len(),
        snapshot.reviews.len()
    );
    Ok(())
}

pub fn export(app: &App, file: Option<&Path>) -> Result<()> {
    let snapshot = app.store.export_snapshot().context("Failed to read local data")?;
    let bytes = snapshot.to_json()?;

    match file {
        Some(path) => {
            std::fs::write(path, &bytes).with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Exported {} deck(s) to {}", snapshot.decks.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            writeln!(stdout)?;
        }
    }

    Ok(())
}

pub async fn reset(app: &App, format: &OutputFormat) -> Result<()> {
    let manager = app.sync_manager()?;
    super::sync::report(&manager.factory_reset().await, format)
}
