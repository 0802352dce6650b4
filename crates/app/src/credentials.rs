use anyhow::Result;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::RemoteError;
use crate::prism_cli::PrismCli;
use crate::state::{SharedStateStore, keys};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub service_url: String,
}

/// The pair every remote call needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub service_url: String,
}

impl Session {
    /// Builds a session, refusing blank tokens or URLs before any network use.
    pub fn new(
        access_token: Option<String>,
        service_url: Option<String>,
    ) -> Result<Self, RemoteError> {
        let access_token = access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| RemoteError::Configuration("access token is not set".into()))?;
        let service_url = service_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| RemoteError::Configuration("service url is not set".into()))?;
        Ok(Self {
            access_token,
            service_url,
        })
    }
}

/// Process-wide credential holder. Changes are broadcast to every subscriber and
/// mirrored into global state so a restart picks them back up.
pub struct CredentialStore {
    tx: watch::Sender<Credentials>,
    storage: SharedStateStore,
    default_url: String,
}

impl CredentialStore {
    pub fn new(storage: SharedStateStore, default_url: impl Into<String>) -> Self {
        let default_url = default_url.into();
        let initial = Credentials {
            access_token: storage.get_string(keys::ACCESS_TOKEN),
            refresh_token: storage.get_string(keys::REFRESH_TOKEN),
            service_url: storage
                .get_string(keys::SERVICE_URL)
                .unwrap_or_else(|| default_url.clone()),
        };
        let (tx, _) = watch::channel(initial);
        Self {
            tx,
            storage,
            default_url,
        }
    }

    pub fn current(&self) -> Credentials {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Credentials> {
        self.tx.subscribe()
    }

    pub fn require_session(&self) -> Result<Session, RemoteError> {
        let current = self.current();
        Session::new(current.access_token, Some(current.service_url))
    }

    pub fn set_tokens(&self, access_token: Option<String>, refresh_token: Option<String>) -> Result<()> {
        self.storage
            .set_optional(keys::ACCESS_TOKEN, access_token.clone().map(Value::String))?;
        self.storage
            .set_optional(keys::REFRESH_TOKEN, refresh_token.clone().map(Value::String))?;
        self.tx.send_modify(|creds| {
            creds.access_token = access_token;
            creds.refresh_token = refresh_token;
        });
        debug!("credentials updated");
        Ok(())
    }

    pub fn set_service_url(&self, url: impl Into<String>) -> Result<()> {
        let url = url.into();
        self.storage
            .set(keys::SERVICE_URL, Value::String(url.clone()))?;
        self.tx.send_modify(|creds| creds.service_url = url);
        Ok(())
    }

    /// Pulls fresh tokens from the Prism CLI's own session.
    pub async fn refresh_from_cli(&self, cli: &PrismCli) -> Result<()> {
        let service_url = self.current().service_url;
        let access = cli.access_token(&service_url).await?;
        let refresh = cli.refresh_token(&service_url).await.ok();
        self.set_tokens(Some(access), refresh)?;
        info!(%service_url, "refreshed credentials from prism cli");
        Ok(())
    }

    pub fn logout(&self) -> Result<()> {
        self.set_tokens(None, None)
    }

    /// Resets the in-memory view without touching persisted tokens.
    pub fn clear(&self) {
        let default_url = self.default_url.clone();
        self.tx.send_modify(|creds| {
            *creds = Credentials {
                access_token: None,
                refresh_token: None,
                service_url: default_url,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InMemoryStateStore, StateStore};

    #[test]
    fn session_requires_token_and_url() {
        assert!(matches!(
            Session::new(None, Some("https://app.prismatic.io".into())),
            Err(RemoteError::Configuration(_))
        ));
        assert!(matches!(
            Session::new(Some("tok".into()), Some("  ".into())),
            Err(RemoteError::Configuration(_))
        ));
        assert!(Session::new(Some("tok".into()), Some("https://x".into())).is_ok());
    }

    #[test]
    fn set_tokens_notifies_and_persists() {
        let storage = InMemoryStateStore::new();
        let store = CredentialStore::new(storage.clone(), "https://app.prismatic.io");
        let mut rx = store.subscribe();
        assert!(store.require_session().is_err());

        store
            .set_tokens(Some("access".into()), Some("refresh".into()))
            .unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().access_token.as_deref(), Some("access"));
        assert_eq!(storage.get_string(keys::REFRESH_TOKEN).as_deref(), Some("refresh"));
        assert_eq!(store.require_session().unwrap().access_token, "access");
    }

    #[test]
    fn logout_clears_stored_tokens_but_clear_does_not() {
        let storage = InMemoryStateStore::new();
        let store = CredentialStore::new(storage.clone(), "https://app.prismatic.io");
        store.set_tokens(Some("a".into()), None).unwrap();

        store.clear();
        assert!(store.current().access_token.is_none());
        assert_eq!(storage.get_string(keys::ACCESS_TOKEN).as_deref(), Some("a"));

        store.logout().unwrap();
        assert!(storage.get(keys::ACCESS_TOKEN).is_none());
    }
}
