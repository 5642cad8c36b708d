//! Persistence for the single Gemini API key.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::config::{Config, APP_DIR_NAME};
use crate::error::{AppError, Result};

/// Key under which the token is stored.
pub const STORAGE_KEY: &str = "gemini_api_key";
const CREDENTIALS_FILE_NAME: &str = "credentials.json";

pub trait CredentialStore {
    /// Persist `token`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`] for an empty or whitespace-only token,
    /// leaving the stored key untouched.
    fn save(&mut self, token: &str) -> Result<()>;

    /// The persisted token, if any. Never fails.
    fn load(&self) -> Option<String>;

    fn has_credential(&self) -> bool {
        self.load().is_some()
    }
}

fn validated(token: &str) -> Result<&str> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation);
    }
    Ok(trimmed)
}

/// File-backed store: a small JSON object in the user config directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the configured override, or `<config dir>/groundcover/credentials.json`.
    pub fn from_config(config: &Config) -> Result<Self> {
        if let Some(path) = config.credentials.path.clone() {
            return Ok(Self::new(path));
        }
        dirs::config_dir()
            .map(|dir| Self::new(dir.join(APP_DIR_NAME).join(CREDENTIALS_FILE_NAME)))
            .ok_or_else(|| {
                AppError::Store("config directory not found, cannot store credentials".into())
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // Only a directory created here is locked down; existing ones keep their mode.
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    AppError::Store(format!("mkdir {}: {e}", parent.display()))
                })?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Err(e) = fs::set_permissions(parent, fs::Permissions::from_mode(0o700)) {
                        tracing::warn!("failed to chmod 0700 {}: {e}", parent.display());
                    }
                }
            }
        }

        let mut entries = BTreeMap::new();
        entries.insert(STORAGE_KEY, token);
        let raw = serde_json::to_string_pretty(&entries)
            .map_err(|e| AppError::Store(format!("serialize credentials: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        let written = write_private(&tmp, raw.as_bytes()).and_then(|()| {
            fs::rename(&tmp, &self.path)
                .map_err(|e| AppError::Store(format!("rename {}: {e}", self.path.display())))
        });
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        written
    }
}

/// Write `bytes` to a fresh file that is 0600 from the moment it exists.
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let store_err = |e: std::io::Error| AppError::Store(format!("write {}: {e}", path.display()));
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(store_err(e)),
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(store_err)?;
    file.write_all(bytes).map_err(store_err)?;
    file.sync_all().map_err(store_err)
}

impl CredentialStore for FileCredentialStore {
    fn save(&mut self, token: &str) -> Result<()> {
        let token = validated(token)?;
        self.write_file(token)?;
        tracing::info!(path = %self.path.display(), "API key saved");
        Ok(())
    }

    fn load(&self) -> Option<String> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                tracing::warn!(%error, path = %self.path.display(), "credentials file unreadable");
                return None;
            }
        };
        match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
            Ok(mut entries) => entries
                .remove(STORAGE_KEY)
                .filter(|token| !token.trim().is_empty()),
            Err(error) => {
                tracing::warn!(%error, path = %self.path.display(), "credentials file malformed");
                None
            }
        }
    }
}

/// In-memory store used by tests.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    token: Option<String>,
}

#[cfg(test)]
impl MemoryCredentialStore {
    pub fn with_token(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
        }
    }
}

#[cfg(test)]
impl CredentialStore for MemoryCredentialStore {
    fn save(&mut self, token: &str) -> Result<()> {
        self.token = Some(validated(token)?.to_string());
        Ok(())
    }

    fn load(&self) -> Option<String> {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trips_token() {
        let dir = tempdir().unwrap();
        let mut store = FileCredentialStore::new(dir.path().join("nested").join("creds.json"));
        assert!(!store.has_credential());

        store.save("AIza-test-123").unwrap();
        assert_eq!(store.load().as_deref(), Some("AIza-test-123"));

        store.save("  second-key \n").unwrap();
        assert_eq!(store.load().as_deref(), Some("second-key"));
    }

    #[test]
    fn blank_tokens_are_rejected_and_keep_existing_key() {
        let dir = tempdir().unwrap();
        let mut store = FileCredentialStore::new(dir.path().join("creds.json"));
        store.save("keep-me").unwrap();

        assert!(matches!(store.save(""), Err(AppError::Validation)));
        assert!(matches!(store.save("   "), Err(AppError::Validation)));
        assert_eq!(store.load().as_deref(), Some("keep-me"));
    }

    #[test]
    fn file_uses_fixed_key_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let mut store = FileCredentialStore::new(&path);
        store.save("abc").unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw[STORAGE_KEY], "abc");
    }

    #[cfg(unix)]
    #[test]
    fn credentials_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");
        FileCredentialStore::new(&path).save("secret").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credentials file should be 0600");
    }

    #[cfg(unix)]
    #[test]
    fn existing_parent_directory_keeps_its_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let shared = dir.path().join("shared");
        fs::create_dir(&shared).unwrap();
        fs::set_permissions(&shared, fs::Permissions::from_mode(0o755)).unwrap();

        FileCredentialStore::new(shared.join("creds.json")).save("secret").unwrap();
        let mode = fs::metadata(&shared).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);

        let created = dir.path().join("fresh");
        FileCredentialStore::new(created.join("creds.json")).save("secret").unwrap();
        let mode = fs::metadata(&created).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn temp_file_is_cleaned_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let tmp = dir.path().join("creds.json.tmp");
        fs::write(&tmp, "stale").unwrap();

        let mut store = FileCredentialStore::new(&path);
        store.save("fresh").unwrap();
        assert!(!tmp.exists());
        assert_eq!(store.load().as_deref(), Some("fresh"));

        // a directory in the way makes the final rename fail
        let blocked = dir.path().join("blocked.json");
        fs::create_dir(&blocked).unwrap();
        let err = FileCredentialStore::new(&blocked).save("fresh").unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
        assert!(!dir.path().join("blocked.json.tmp").exists());
    }

    #[test]
    fn malformed_or_empty_files_load_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");

        fs::write(&path, "not json").unwrap();
        assert_eq!(FileCredentialStore::new(&path).load(), None);

        fs::write(&path, r#"{"gemini_api_key": "   "}"#).unwrap();
        assert_eq!(FileCredentialStore::new(&path).load(), None);
    }

    #[test]
    fn memory_store_validates_like_file_store() {
        let mut store = MemoryCredentialStore::with_token("first");
        assert!(store.save(" ").is_err());
        assert_eq!(store.load().as_deref(), Some("first"));
    }
}
