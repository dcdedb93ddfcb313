//! API key storage: a private file under the data directory, with the OS
//! keyring as a fallback.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::error::{Result, SyncError};

const SERVICE: &str = "mnemo-sync";

#[derive(Debug, Clone)]
pub struct CredentialStore {
    data_dir: PathBuf,
}

impl CredentialStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn file_path(&self, app_id: &str) -> PathBuf {
        self.data_dir.join(".credentials").join(SERVICE).join(app_id)
    }

    /// Try the file first, then the keyring
    pub fn api_key(&self, app_id: &str) -> Result<String> {
        if let Some(key) = read_key_file(&self.file_path(app_id)) {
            return Ok(key);
        }

        let entry = keyring::Entry::new(SERVICE, app_id).map_err(|e| SyncError::Keyring(e.to_string()))?;
        let key = entry
            .get_password()
            .map_err(|_| SyncError::CredentialsMissing)?;
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(SyncError::CredentialsMissing);
        }
        Ok(key)
    }

    pub fn has_api_key(&self, app_id: &str) -> bool {
        self.api_key(app_id).is_ok()
    }

    /// Write to the file store and, best-effort, the keyring
    pub fn store_api_key(&self, app_id: &str, key: &str) -> Result<()> {
        let path = self.file_path(app_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(&path, key.trim())?;

        if let Ok(entry) = keyring::Entry::new(SERVICE, app_id) {
            let _ = entry.set_password(key.trim());
        }
        log::info!("Sync: stored API key for app {}", app_id);
        Ok(())
    }

    pub fn delete_api_key(&self, app_id: &str) -> Result<()> {
        let _ = std::fs::remove_file(self.file_path(app_id));
        if let Ok(entry) = keyring::Entry::new(SERVICE, app_id) {
            let _ = entry.delete_credential();
        }
        Ok(())
    }
}

/// Owner-only from creation on; a file left by an older version is
/// narrowed before the key is written into it
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents.as_bytes())?;
    file.sync_all()
}

fn read_key_file(path: &Path) -> Option<String> {
    let data = std::fs::read_to_string(path).ok()?;
    let key = data.trim();
    (!key.is_empty()).then(|| key.to_string())
}
