use anyhow::{Context, Result};
use chrono::Utc;

use mnemo_lib::flashcards::review::{deck_stats, due_items, start_session};
use mnemo_lib::flashcards::{
    effective_mastery, format_interval, preview_intervals, project_workload, review_item, Rating, ReviewState,
    Reviewable,
};
use mnemo_lib::storage::{Deck, SessionKind};
use mnemo_lib::sync::{local_has_changes, SyncMetadata};

use crate::app::{item_text, App};
use crate::OutputFormat;

pub fn status(app: &App, format: &OutputFormat) -> Result<()> {
    let decks = app.decks()?;
    let today = app.today();
    let now = Utc::now();
    let metadata = SyncMetadata::load(&app.store).context("Failed to read sync state")?;
    let last_modified = app.store.last_modified()?;
    let unsynced = local_has_changes(last_modified, metadata.baseline());
    let sync = &app.config.sync;

    match format {
        OutputFormat::Json => {
            let deck_list: Vec<serde_json::Value> = decks
                .iter()
                .map(|deck| {
                    let stats = deck_stats(deck, today, now);
                    serde_json::json!({
                        "id": deck.id,
                        "name": deck.name,
                        "kind": deck.kind(),
                        "stats": stats,
                    })
                })
                .collect();
            let output = serde_json::json!({
                "dataDir": app.data_dir,
                "decks": deck_list,
                "sync": {
                    "enabled": sync.enabled,
                    "configured": sync.is_configured(),
                    "clientId": metadata.client_id,
                    "lastSync": metadata.last_sync.map(|t| t.to_rfc3339()),
                    "lastStatus": metadata.last_status,
                    "unsyncedChanges": unsynced,
                },
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            if decks.is_empty() {
                println!("No decks.");
            } else {
                let name_width = decks.iter().map(|d| d.name.len()).max().unwrap_or(4).clamp(4, 40);
                println!("{:<nw$} {:>5} {:>5} {:>5} {:>8}", "Deck", "Items", "Due", "New", "Mastery", nw = name_width);
                for deck in &decks {
                    let stats = deck_stats(deck, today, now);
                    println!(
                        "{:<nw$} {:>5} {:>5} {:>5} {:>7.0}%",
                        deck.name,
                        stats.total_items,
                        stats.due_items,
                        stats.new_items,
                        stats.average_mastery * 100.0,
                        nw = name_width
                    );
                }
            }

            println!();
            if !sync.enabled {
                println!("Sync: off");
            } else if !sync.is_configured() {
                println!("Sync: no server configured");
            } else {
                let last = metadata
                    .last_sync
                    .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!("Sync: {} (last sync {})", sync.server_url, last);
                if let Some(message) = &metadata.last_status {
                    println!("  {}", message);
                }
            }
            if unsynced {
                println!("  Local changes not yet synced");
            }
        }
    }

    Ok(())
}

pub fn due(app: &App, deck: Option<&str>, format: &OutputFormat) -> Result<()> {
    let decks = selected_decks(app, deck)?;
    let today = app.today();
    let now = Utc::now();
    let new_limit = app.config.scheduler.new_per_day;

    match format {
        OutputFormat::Json => {
            let output: Vec<serde_json::Value> = decks
                .iter()
                .map(|deck| {
                    let items: Vec<serde_json::Value> = due_items(deck, today, now, new_limit)
                        .into_iter()
                        .map(|item| {
                            let review = item.review();
                            serde_json::json!({
                                "id": item.id(),
                                "prompt": item_text(deck, item.id()).map(|(prompt, _)| prompt),
                                "new": review.is_new(),
                                "dueDate": review.due_date,
                                "mastery": effective_mastery(review, now),
                            })
                        })
                        .collect();
                    serde_json::json!({
                        "deckId": deck.id,
                        "deck": deck.name,
                        "items": items,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            let mut any = false;
            for deck in &decks {
                let items = due_items(deck, today, now, new_limit);
                if items.is_empty() {
                    continue;
                }
                any = true;
                println!("{} ({} due)", deck.name, items.len());
                for item in items {
                    let prompt = item_text(deck, item.id())
                        .map(|(prompt, _)| first_line(&prompt).to_string())
                        .unwrap_or_default();
                    let marker = if item.review().is_new() { " [new]" } else { "" };
                    println!("  {}{}", prompt, marker);
                }
            }
            if !any {
                println!("Nothing due today.");
            }
        }
    }

    Ok(())
}

pub fn review(app: &App, deck_name: &str, rating: Option<&str>, format: &OutputFormat) -> Result<()> {
    let mut deck = app.find_deck(deck_name)?;
    let today = app.today();
    let scheduler = &app.config.scheduler;
    let mut session = start_session(&app.store, &deck, SessionKind::Review, today, scheduler.new_per_day)
        .context("Failed to start a review session")?;

    let mut answered = None;
    if let Some(rating) = rating {
        let rating: Rating = rating.parse()?;
        let Some(item_id) = session.current_item().map(str::to_string) else {
            println!("Nothing left to review in {}.", deck.name);
            return Ok(());
        };

        let outcome = review_item(&app.store, &deck.id, &item_id, rating, &scheduler.leech_policy(), today)
            .context("Failed to record the review")?;
        deck = outcome.deck;
        session.advance();
        if session.is_finished() {
            app.store.clear_session(&deck.id, SessionKind::Review)?;
        } else {
            app.store.save_session(&session)?;
        }

        let next = deck
            .items()
            .into_iter()
            .find(|item| item.id() == item_id)
            .map(|item| item.review().clone());
        answered = Some((item_id, rating, next, outcome.became_leech));
    }

    let current = session
        .current_item()
        .and_then(|id| current_item(&deck, id, today));

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "deck": deck.name,
                "answered": answered.as_ref().map(|(id, rating, state, leech)| serde_json::json!({
                    "id": id,
                    "rating": rating,
                    "interval": state.as_ref().map(|s| s.interval),
                    "dueDate": state.as_ref().map(|s| s.due_date),
                    "becameLeech": leech,
                })),
                "remaining": session.item_queue.len().saturating_sub(session.current_index),
                "current": current.as_ref().map(|item| serde_json::json!({
                    "id": item.id,
                    "prompt": item.prompt,
                    "answer": item.answer,
                    "intervals": {
                        "again": item.intervals[0],
                        "good": item.intervals[1],
                        "easy": item.intervals[2],
                    },
                })),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            if let Some((_, rating, state, leech)) = &answered {
                if let Some(state) = state {
                    println!("Rated {}: next review in {}", rating, format_interval(state.interval));
                }
                if *leech {
                    println!("This item keeps lapsing and is now a leech ({:?}).", scheduler.leech_action);
                }
                println!();
            }

            match &current {
                Some(item) => {
                    let remaining = session.item_queue.len().saturating_sub(session.current_index);
                    println!("{} ({} left)", deck.name, remaining);
                    println!();
                    println!("{}", item.prompt);
                    println!();
                    println!("Answer: {}", item.answer);
                    println!();
                    println!(
                        "again {} | good {} | easy {}",
                        format_interval(item.intervals[0]),
                        format_interval(item.intervals[1]),
                        format_interval(item.intervals[2])
                    );
                }
                None => println!("Review of {} complete.", deck.name),
            }
        }
    }

    Ok(())
}

pub fn forecast(app: &App, deck: Option<&str>, days: u32, format: &OutputFormat) -> Result<()> {
    let decks = selected_decks(app, deck)?;
    let states: Vec<&ReviewState> = decks.iter().flat_map(|d| d.review_states()).collect();
    let scheduler = &app.config.scheduler;
    let summary = project_workload(
        states,
        days,
        scheduler.new_per_day,
        scheduler.retention_rate,
        app.today(),
    );

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Plain => {
            println!("{:<12} {:>7} {:>5} {:>6}", "Date", "Reviews", "New", "Total");
            for day in &summary {
                println!(
                    "{:<12} {:>7} {:>5} {:>6}",
                    day.date.format("%a %m-%d"),
                    day.review_count,
                    day.new_count,
                    day.total_load
                );
            }
        }
    }

    Ok(())
}

struct CurrentItem {
    id: String,
    prompt: String,
    answer: String,
    intervals: [u32; 3],
}

fn current_item(deck: &Deck, item_id: &str, today: chrono::NaiveDate) -> Option<CurrentItem> {
    let item = deck.items().into_iter().find(|item| item.id() == item_id)?;
    let (prompt, answer) = item_text(deck, item_id)?;
    Some(CurrentItem {
        id: item_id.to_string(),
        prompt,
        answer,
        intervals: preview_intervals(item.review(), today),
    })
}

fn selected_decks(app: &App, deck: Option<&str>) -> Result<Vec<Deck>> {
    match deck {
        Some(name) => Ok(vec![app.find_deck(name)?]),
        None => app.decks(),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
