pub mod registrar;
pub mod retry;
pub mod watcher;


use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use registrar::{
    register, register_with_config, Registration, RegistrarConfig, RegistrarState, MAX_PENDING_CREDENTIALS,
};
pub use retry::{retry_until_success, RetryPolicy};
pub use watcher::CredentialWatcher;

/// TTL of a host's liveness record.
pub const HEARTBEAT_DURATION: Duration = Duration::from_secs(5);

/// Delay between two attempts to refresh a lost liveness record.
pub const HEARTBEAT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid service record: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One running instance of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub public_hostname: String,
    pub user: String,
    pub password: String,
}

/// Description of a service shared by all of its instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Infos {
    pub name: String,
    pub public_hostname: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Host {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }

    pub fn set_credentials(&mut self, credentials: &Credentials) {
        self.user = credentials.user.clone();
        self.password = credentials.password.clone();
    }
}

impl Infos {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }

    pub fn set_credentials(&mut self, credentials: &Credentials) {
        self.user = credentials.user.clone();
        self.password = credentials.password.clone();
    }
}

pub fn host_key(service: &str, host_name: &str) -> String {
    format!("/services/{}/{}", service, host_name)
}

pub fn service_key(service: &str) -> String {
    format!("/services_infos/{}", service)
}

/// Reconcile the caller's host and shared record before anything is written.
/// The shared record wins: the host ends up with its public hostname and
/// credentials.
pub(crate) fn prepare(service: &str, host: &mut Host, infos: Option<Infos>, default_name: &str) -> Infos {
    if host.name.is_empty() {
        host.name = default_name.to_string();
    }

    let mut infos = infos.unwrap_or_else(|| Infos {
        user: host.user.clone(),
        password: host.password.clone(),
        ..Default::default()
    });

    if infos.public_hostname.is_empty() && !host.public_hostname.is_empty() {
        infos.public_hostname = host.public_hostname.clone();
    }
    infos.name = service.to_string();

    host.public_hostname = infos.public_hostname.clone();
    host.set_credentials(&infos.credentials());

    infos
}
