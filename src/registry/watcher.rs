use super::{Credentials, Infos, RegistryError};
use crate::store::{Store, Versioned};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Follows the shared service record and forwards every credential change.
///
/// Exactly one `watch_from` call is outstanding at a time. The cursor only
/// moves after a change has been decoded, so a failed or malformed change is
/// asked for again from the same position.
pub struct CredentialWatcher {
    store: Arc<dyn Store>,
    key: String,
    cursor: u64,
    credentials_tx: mpsc::Sender<Credentials>,
    cancel_token: CancellationToken,
}

enum Step {
    Armed,
    Cancelled,
}

impl CredentialWatcher {
    pub fn new(
        store: Arc<dyn Store>,
        key: String,
        cursor: u64,
        credentials_tx: mpsc::Sender<Credentials>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            key,
            cursor,
            credentials_tx,
            cancel_token,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        debug!(key = %self.key, cursor = self.cursor, "Credential watcher started");

        while let Step::Armed = self.step().await {}

        debug!(key = %self.key, cursor = self.cursor, "Credential watcher stopped");
    }

    async fn step(&mut self) -> Step {
        let change = tokio::select! {
            _ = self.cancel_token.cancelled() => return Step::Cancelled,
            change = self.store.watch_from(&self.key, self.cursor) => change,
        };

        let credentials = match change.map_err(RegistryError::from).and_then(|c| self.accept(c)) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(
                    key = %self.key,
                    cursor = self.cursor,
                    endpoints = ?self.store.endpoints(),
                    "lost watcher of '{}': {}",
                    self.key,
                    e
                );
                // let the rest of the runtime run before asking again
                tokio::task::yield_now().await;
                return Step::Armed;
            }
        };

        tokio::select! {
            _ = self.cancel_token.cancelled() => Step::Cancelled,
            sent = self.credentials_tx.send(credentials) => match sent {
                Ok(()) => Step::Armed,
                // nobody left to tell
                Err(_) => Step::Cancelled,
            },
        }
    }

    fn accept(&mut self, change: Versioned) -> Result<Credentials, RegistryError> {
        let infos: Infos = serde_json::from_slice(&change.value)?;
        self.cursor = self.cursor.max(change.version);
        debug!(key = %self.key, cursor = self.cursor, "Observed service record change");
        Ok(infos.credentials())
    }
}
