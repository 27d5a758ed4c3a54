//! Access token persistence
//!
//! [`TokenStore`] is the capability the credential manager depends on. Three backends are
//! provided: [`InMemoryTokenStore`], [`FileTokenStore`] and [`KeyedFileTokenStore`].

use crate::error::{ClientError, Result};
use crate::types::{AccessToken, ApiKey, TokenRecord};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info};

/// Directory under the user configuration root holding per-key token caches
pub const CONFIG_NAMESPACE: &str = "dfuse";

/// Token cache file name inside a key directory
pub const TOKEN_FILE_NAME: &str = "token.json";

/// Holder of the current access token
///
/// `get` returns `Ok(None)` when no token was ever stored, that is not an error.
#[async_trait]
pub trait TokenStore: fmt::Display + Send + Sync + 'static {
    async fn get(&self) -> Result<Option<AccessToken>>;

    /// Replace the current token. Persistent stores have written it when this returns.
    async fn set(&self, token: AccessToken) -> Result<()>;
}

/// Keeps the token in memory only
///
/// The token is lost on restart, leading to a new token being issued. Prefer a persistent
/// store so the same token is reused as long as it is valid.
#[derive(Default)]
pub struct InMemoryTokenStore {
    active: RwLock<Option<AccessToken>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self) -> Result<Option<AccessToken>> {
        Ok(self.active.read().clone())
    }

    async fn set(&self, token: AccessToken) -> Result<()> {
        *self.active.write() = Some(token);
        Ok(())
    }
}

impl fmt::Display for InMemoryTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("in-memory")
    }
}

/// Saves the token as plain-text JSON in `file_path`
///
/// The file is read once, on the first `get` that finds nothing in memory. Parent
/// directories are created on `set`.
pub struct FileTokenStore {
    file_path: PathBuf,
    active: AsyncRwLock<Option<AccessToken>>,
}

impl FileTokenStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        info!(file_path = %file_path.display(), "Creating file token store");

        Self {
            file_path,
            active: AsyncRwLock::new(None),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn store_error(&self, source: std::io::Error) -> ClientError {
        ClientError::TokenStore {
            path: self.file_path.clone(),
            source,
        }
    }

    async fn load(&self) -> Result<Option<AccessToken>> {
        debug!(file_path = %self.file_path.display(), "Active token is not set, opening file");

        let content = match tokio::fs::read(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("File token store does not exist");
                return Ok(None);
            }
            Err(e) => return Err(self.store_error(e)),
        };

        let record: TokenRecord = serde_json::from_slice(&content)
            .map_err(|e| self.store_error(std::io::Error::new(ErrorKind::InvalidData, e)))?;

        debug!("File token store decoded content is now active");
        Ok(Some(record.into()))
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self) -> Result<Option<AccessToken>> {
        if let Some(active) = self.active.read().await.as_ref() {
            return Ok(Some(active.clone()));
        }

        let mut active = self.active.write().await;

        // Another caller may have loaded the file while we waited for the lock
        if active.is_none() {
            *active = self.load().await?;
        }

        Ok(active.clone())
    }

    async fn set(&self, token: AccessToken) -> Result<()> {
        let mut active = self.active.write().await;

        if let Some(dir) = self.file_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| self.store_error(e))?;
        }

        let content = serde_json::to_vec(&TokenRecord::from(&token))?;
        tokio::fs::write(&self.file_path, content)
            .await
            .map_err(|e| self.store_error(e))?;

        *active = Some(token);
        Ok(())
    }
}

impl fmt::Display for FileTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file ({})", self.file_path.display())
    }
}

/// File token store located at `<config dir>/dfuse/<sha256(api key)>/token.json`
///
/// Clients built with the same API key share the cache without being given a path, and the
/// key itself never appears on disk.
pub struct KeyedFileTokenStore {
    inner: FileTokenStore,
}

impl KeyedFileTokenStore {
    /// Store rooted in the platform user configuration directory
    pub fn new(api_key: &ApiKey) -> Result<Self> {
        let root = dirs::config_dir().ok_or_else(|| {
            ClientError::Configuration(
                "unable to determine user configuration directory, use FileTokenStore with an explicit path".to_string(),
            )
        })?;

        Ok(Self::with_root(root, api_key))
    }

    /// Store rooted in `root` instead of the user configuration directory
    pub fn with_root(root: impl AsRef<Path>, api_key: &ApiKey) -> Self {
        let sum = api_key.credential_key();
        info!(root = %root.as_ref().display(), sum = %sum, "Creating keyed file token store");

        let file_path = root
            .as_ref()
            .join(CONFIG_NAMESPACE)
            .join(sum)
            .join(TOKEN_FILE_NAME);

        Self {
            inner: FileTokenStore::new(file_path),
        }
    }

    pub fn file_path(&self) -> &Path {
        self.inner.file_path()
    }
}

#[async_trait]
impl TokenStore for KeyedFileTokenStore {
    async fn get(&self) -> Result<Option<AccessToken>> {
        self.inner.get().await
    }

    async fn set(&self, token: AccessToken) -> Result<()> {
        self.inner.set(token).await
    }
}

impl fmt::Display for KeyedFileTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "keyed {}", self.inner)
    }
}
