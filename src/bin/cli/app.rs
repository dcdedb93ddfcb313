use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;

use mnemo_lib::config::{default_data_dir, AppConfig};
use mnemo_lib::storage::{Deck, DeckContent, LocalStore};
use mnemo_lib::sync::{
    AutoConfirm, Confirmer, CredentialStore, DestructiveAction, HttpBlobStore, RemoteSyncClient, SkipReason,
    SyncManager, SyncSession,
};

/// Shared application state for CLI commands
pub struct App {
    pub data_dir: PathBuf,
    pub config: AppConfig,
    pub store: Arc<LocalStore>,
    pub credentials: CredentialStore,
    /// Skip confirmation prompts
    pub assume_yes: bool,
}

impl App {
    pub fn new(data_dir: Option<PathBuf>, assume_yes: bool) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => default_data_dir().context("Failed to get data directory")?,
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;

        let config = AppConfig::load(&data_dir).context("Failed to load config")?;
        let store = LocalStore::open(&data_dir.join("mnemo.db")).context("Failed to open the local store")?;

        Ok(Self {
            credentials: CredentialStore::new(&data_dir),
            data_dir,
            config,
            store: Arc::new(store),
            assume_yes,
        })
    }

    pub fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }

    /// Live (not soft-deleted) decks
    pub fn decks(&self) -> Result<Vec<Deck>> {
        let mut decks: Vec<Deck> = self
            .store
            .get_all::<Deck>()
            .context("Failed to list decks")?
            .into_iter()
            .filter(|d| !d.is_deleted())
            .collect();
        decks.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(decks)
    }

    /// Find a deck by name (case-insensitive prefix match)
    pub fn find_deck(&self, name: &str) -> Result<Deck> {
        let decks = self.decks()?;
        let name_lower = name.to_lowercase();

        // Exact match first
        if let Some(deck) = decks.iter().find(|d| d.name.to_lowercase() == name_lower) {
            return Ok(deck.clone());
        }

        let matches: Vec<&Deck> = decks
            .iter()
            .filter(|d| d.name.to_lowercase().starts_with(&name_lower))
            .collect();

        match matches.len() {
            0 => bail!(
                "No deck matching '{}'. Available decks:\n{}",
                name,
                decks.iter().map(|d| format!("  - {}", d.name)).collect::<Vec<_>>().join("\n")
            ),
            1 => Ok(matches[0].clone()),
            _ => bail!(
                "Ambiguous deck name '{}'. Matches:\n{}",
                name,
                matches.iter().map(|d| format!("  - {}", d.name)).collect::<Vec<_>>().join("\n")
            ),
        }
    }

    fn confirmer(&self) -> Arc<dyn Confirmer> {
        if self.assume_yes {
            Arc::new(AutoConfirm)
        } else {
            Arc::new(StdinConfirmer)
        }
    }

    /// Ask on stdin unless `--yes` was given
    pub fn confirm(&self, action: DestructiveAction) -> bool {
        self.confirmer().confirm(action)
    }

    pub fn sync_manager(&self) -> Result<SyncManager> {
        let settings = &self.config.sync;
        let session = Arc::new(SyncSession::load(&self.store).context("Failed to read sync state")?);
        let options = settings.options();

        let manager = if !settings.is_configured() {
            SyncManager::without_remote(self.store.clone(), session, SkipReason::NotConfigured, options)
        } else if let Ok(api_key) = self.credentials.api_key(&settings.app_id) {
            let retry = self.config.retry.policy();
            let endpoint =
                HttpBlobStore::new(&settings.server_url, &settings.app_id, &api_key, retry.attempt_timeout)
                    .context("Invalid sync server settings")?;
            let client = RemoteSyncClient::new(Arc::new(endpoint), settings.backup_name.clone(), retry);
            SyncManager::new(self.store.clone(), session, client, options)
        } else {
            SyncManager::without_remote(self.store.clone(), session, SkipReason::CredentialsMissing, options)
        };
        Ok(manager.with_confirmer(self.confirmer()))
    }
}

/// Prompts "[y/N]" on the terminal
struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, action: DestructiveAction) -> bool {
        eprint!("{}? [y/N] ", action);
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

/// Prompt and answer text for an item
pub fn item_text(deck: &Deck, item_id: &str) -> Option<(String, String)> {
    match &deck.content {
        DeckContent::Flashcard { cards } => cards
            .iter()
            .find(|c| c.id == item_id)
            .map(|c| (c.front.clone(), c.back.clone())),
        DeckContent::Quiz { questions } | DeckContent::Learning { questions, .. } => {
            questions.iter().find(|q| q.id == item_id).map(|q| {
                let options = q
                    .options
                    .iter()
                    .enumerate()
                    .map(|(i, o)| format!("\n  {}. {}", i + 1, o))
                    .collect::<String>();
                let answer = match &q.explanation {
                    Some(explanation) => format!("{}\n  {}", q.correct_answer, explanation),
                    None => q.correct_answer.clone(),
                };
                (format!("{}{}", q.prompt, options), answer)
            })
        }
    }
}
