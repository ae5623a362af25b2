pub mod registry;
pub mod store;
pub mod utils;

use once_cell::sync::Lazy;
use std::env;

pub use registry::{
    register, register_with_config, Credentials, Host, Infos, Registration, RegistrarConfig,
    RegistrarState,
};
pub use store::{etcd::EtcdStore, Store, StoreError, Versioned};

const DEFAULT_ETCD_ENDPOINT: &str = "http://127.0.0.1:2379";

/// Etcd endpoints, comma separated in `ETCD_ENDPOINTS`.
pub static ETCD_ENDPOINTS: Lazy<Vec<String>> = Lazy::new(|| {
    let raw = env::var("ETCD_ENDPOINTS").unwrap_or_else(|_| DEFAULT_ETCD_ENDPOINT.to_string());
    parse_endpoints(&raw)
});

/// Name used for hosts registered without an explicit one.
pub static HOSTNAME: Lazy<String> = Lazy::new(|| {
    env::var("SERVICE_HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string())
        })
});

/// Load `.env` into the process environment, if there is one.
pub fn init_env() {
    dotenv::dotenv().ok();
}

fn parse_endpoints(raw: &str) -> Vec<String> {
    let endpoints: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect();

    if endpoints.is_empty() {
        vec![DEFAULT_ETCD_ENDPOINT.to_string()]
    } else {
        endpoints
    }
}
