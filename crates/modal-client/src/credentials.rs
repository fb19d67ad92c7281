//! Loading and rotating the Modal token pair
//!
//! Credentials are mounted as a Kubernetes secret volume. The preferred
//! file names are `MODAL_TOKEN_ID` / `MODAL_TOKEN_SECRET`; older charts
//! mounted them as `token-id` / `token-secret`, and both spellings are
//! accepted. The pair is kept in process memory only and is never written
//! into logs, pod environments, or resource specs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::BackendError;

/// Well-known mount path of the operator token secret.
pub const DEFAULT_SECRET_PATH: &str = "/etc/modal-secret";

const TOKEN_ID_FILE: &str = "MODAL_TOKEN_ID";
const TOKEN_SECRET_FILE: &str = "MODAL_TOKEN_SECRET";
const LEGACY_TOKEN_ID_FILE: &str = "token-id";
const LEGACY_TOKEN_SECRET_FILE: &str = "token-secret";

/// A Modal API token pair.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    /// The public token identifier
    pub token_id: String,
    /// The secret half of the pair
    pub token_secret: String,
}

impl TokenPair {
    /// Renders the pair as the `Authorization` header value the backend
    /// expects.
    pub fn bearer(&self) -> String {
        format!("Bearer {}:{}", self.token_id, self.token_secret)
    }
}

// The secret half must never end up in log output, so Debug is redacted.
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("token_id", &self.token_id)
            .field("token_secret", &"<redacted>")
            .finish()
    }
}

/// Holds the currently loaded token pair and refreshes it from the secret
/// mount when the kubelet rotates the projected files.
pub struct CredentialStore {
    path: PathBuf,
    current: RwLock<TokenPair>,
}

impl CredentialStore {
    /// Load the pair from the given mount path, failing if neither the
    /// preferred nor the legacy file names are present.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Arc<Self>, BackendError> {
        let path = path.into();
        let pair = read_pair(&path).await?;
        info!(path = %path.display(), "Loaded Modal credentials");
        Ok(Arc::new(CredentialStore {
            path,
            current: RwLock::new(pair),
        }))
    }

    /// The most recently loaded token pair.
    pub async fn current(&self) -> TokenPair {
        self.current.read().await.clone()
    }

    /// Spawns a task that re-reads the mount on an interval and swaps the
    /// pair in place when it changes. Secret volume projections update
    /// atomically, so a plain periodic re-read is sufficient.
    pub fn spawn_reloader(
        self: Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match read_pair(&store.path).await {
                    Ok(pair) => {
                        let mut current = store.current.write().await;
                        if *current != pair {
                            info!("Modal credentials rotated, reloading");
                            *current = pair;
                        }
                    }
                    // A transient miss during rotation is not fatal; the
                    // previous pair stays active.
                    Err(e) => warn!(error = %e, "Failed to re-read Modal credentials"),
                }
            }
        })
    }
}

async fn read_pair(path: &Path) -> Result<TokenPair, BackendError> {
    let id_path = path.join(TOKEN_ID_FILE);
    let (id_path, secret_path) = if tokio::fs::metadata(&id_path).await.is_ok() {
        (id_path, path.join(TOKEN_SECRET_FILE))
    } else {
        debug!(path = %path.display(), "Preferred credential files missing, trying legacy names");
        (
            path.join(LEGACY_TOKEN_ID_FILE),
            path.join(LEGACY_TOKEN_SECRET_FILE),
        )
    };

    let token_id = read_trimmed(&id_path).await?;
    let token_secret = read_trimmed(&secret_path).await?;
    if token_id.is_empty() || token_secret.is_empty() {
        return Err(BackendError::Credentials(format!(
            "empty token material in {}",
            path.display()
        )));
    }
    Ok(TokenPair {
        token_id,
        token_secret,
    })
}

async fn read_trimmed(path: &Path) -> Result<String, BackendError> {
    tokio::fs::read_to_string(path)
        .await
        .map(|s| s.trim().to_owned())
        .map_err(|e| BackendError::Credentials(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn loads_preferred_file_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(TOKEN_ID_FILE), "ak-123\n").unwrap();
        std::fs::write(dir.path().join(TOKEN_SECRET_FILE), "as-456\n").unwrap();

        let store = CredentialStore::load(dir.path()).await.expect("load");
        let pair = store.current().await;
        assert_eq!(pair.token_id, "ak-123");
        assert_eq!(pair.token_secret, "as-456");
        assert_eq!(pair.bearer(), "Bearer ak-123:as-456");
    }

    #[tokio::test]
    async fn falls_back_to_legacy_file_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(LEGACY_TOKEN_ID_FILE), "ak-legacy").unwrap();
        std::fs::write(dir.path().join(LEGACY_TOKEN_SECRET_FILE), "as-legacy").unwrap();

        let store = CredentialStore::load(dir.path()).await.expect("load");
        assert_eq!(store.current().await.token_id, "ak-legacy");
    }

    #[tokio::test]
    async fn missing_material_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = CredentialStore::load(dir.path()).await;
        assert!(matches!(result, Err(BackendError::Credentials(_))));
    }

    #[test]
    fn debug_redacts_the_secret() {
        let pair = TokenPair {
            token_id: "ak-123".into(),
            token_secret: "as-456".into(),
        };
        let rendered = format!("{:?}", pair);
        assert!(rendered.contains("ak-123"));
        assert!(!rendered.contains("as-456"));
    }
}
