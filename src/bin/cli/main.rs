mod app;
mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mnemo-cli", about = "Mnemo spaced-repetition study and sync", version)]
struct Cli {
    /// Data directory (default: platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "plain")]
    format: OutputFormat,

    /// Answer yes to every confirmation prompt
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Decks with due counts, and the sync status
    Status,

    /// List items due today
    Due {
        /// Deck name (case-insensitive prefix match); all decks if omitted
        deck: Option<String>,
    },

    /// Study a deck: show the current item, or rate it and move on
    Review {
        /// Deck name
        deck: String,
        /// again, good or easy
        #[arg(long)]
        rating: Option<String>,
    },

    /// Projected reviews per day
    Forecast {
        /// Deck name; all decks if omitted
        deck: Option<String>,
        #[arg(long, default_value = "14")]
        days: u32,
    },

    /// Sync with the remote
    Sync {
        /// Skip the not-modified shortcut and the metered connection check
        #[arg(long)]
        force: bool,
    },

    /// Keep syncing in the background at the configured interval
    Watch,

    /// Overwrite the remote with local data
    Push,

    /// Overwrite local data with the remote
    Fetch,

    /// Undo the last pull, fetch or merge
    RevertFetch,

    /// Sync and settle a divergence by choosing a side per deck or series
    Resolve {
        /// Ids (or name prefixes) to take from the remote; everything else stays local
        #[arg(long = "remote")]
        remote: Vec<String>,
        /// Take every changed entity from the remote
        #[arg(long, conflicts_with = "remote")]
        all_remote: bool,
    },

    /// List backups stored next to the sync blob
    RemoteBackups,

    /// Restore a remote backup and pull it
    RestoreRemote {
        name: String,
    },

    /// Delete a remote backup (never the sync blob itself)
    DeleteRemote {
        name: String,
    },

    /// Hard-delete decks and series deleted more than the retention window ago
    Purge,

    /// Replace local data with a backup file
    Import {
        file: PathBuf,
    },

    /// Write a backup of all local data (stdout if no file)
    Export {
        file: Option<PathBuf>,
    },

    /// Store the API key for the sync server ("-" reads stdin)
    SetKey {
        key: String,
    },

    /// Erase all local data
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let app = app::App::new(cli.data_dir, cli.yes)?;
    let format = &cli.format;

    match cli.command {
        Command::Status => commands::study::status(&app, format)?,
        Command::Due { deck } => commands::study::due(&app, deck.as_deref(), format)?,
        Command::Review { deck, rating } => commands::study::review(&app, &deck, rating.as_deref(), format)?,
        Command::Forecast { deck, days } => commands::study::forecast(&app, deck.as_deref(), days, format)?,
        Command::Sync { force } => commands::sync::sync(&app, force, format).await?,
        Command::Watch => commands::sync::watch(&app).await?,
        Command::Push => commands::sync::push(&app, format).await?,
        Command::Fetch => commands::sync::fetch(&app, format).await?,
        Command::RevertFetch => commands::sync::revert_fetch(&app, format).await?,
        Command::Resolve { remote, all_remote } => {
            commands::sync::resolve(&app, &remote, all_remote, format).await?
        }
        Command::RemoteBackups => commands::sync::remote_backups(&app, format).await?,
        Command::RestoreRemote { name } => commands::sync::restore_remote(&app, &name, format).await?,
        Command::DeleteRemote { name } => commands::sync::delete_remote(&app, &name).await?,
        Command::SetKey { key } => commands::sync::set_key(&app, &key)?,
        Command::Purge => commands::data::purge(&app, format)?,
        Command::Import { file } => commands::data::import(&app, &file)?,
        Command::Export { file } => commands::data::export(&app, file.as_deref())?,
        Command::Reset => commands::data::reset(&app, format).await?,
    }

    Ok(())
}
