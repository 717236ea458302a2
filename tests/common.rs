//! Common test utilities.
//!
//! Integration tests exercise a live Redis server. They look for one at
//! `STRATA_TEST_REDIS_URL` (default `redis://127.0.0.1:6379/`) and skip
//! with a notice when none is reachable, so the suite stays green on
//! machines without a local server. Keys are namespaced per run so
//! concurrent runs do not collide, and every entry written carries a TTL.

#![allow(dead_code)]

use redis::aio::ConnectionManager;
use strata::core::time::owner_token;
use strata::{Client, Options};

/// Install the log subscriber once per test binary; `RUST_LOG` selects the
/// protocol traces to show (e.g. `RUST_LOG=strata=debug`).
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connect to the test server, or `None` when unreachable.
pub async fn connection() -> Option<ConnectionManager> {
    init_tracing();
    let url = std::env::var("STRATA_TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
    let client = redis::Client::open(url).ok()?;
    ConnectionManager::new(client).await.ok()
}

/// A client over the test server with the given options.
pub async fn client_with(options: Options) -> Option<Client> {
    let con = connection().await?;
    Some(Client::new(con, options).expect("test options must be valid"))
}

/// A client over the test server with default options.
pub async fn client() -> Option<Client> {
    client_with(Options::default()).await
}

/// Print the skip notice for a test that found no server.
pub fn skip(test: &str) {
    eprintln!("skipping {test}: no redis server reachable (set STRATA_TEST_REDIS_URL)");
}

/// A key that no other test or run will touch.
pub fn unique_key(prefix: &str) -> String {
    format!("strata:test:{}:{}", prefix, owner_token())
}

/// A run-scoped family of keys, index-suffixed.
pub fn unique_keys(prefix: &str, n: usize) -> Vec<String> {
    let run = owner_token();
    (0..n)
        .map(|i| format!("strata:test:{prefix}:{run}:{i}"))
        .collect()
}

/// Index-keyed values `"{prefix}{i}"` for batch fetch functions.
pub fn indexed_values(n: usize, prefix: &str) -> std::collections::HashMap<usize, String> {
    (0..n).map(|i| (i, format!("{prefix}{i}"))).collect()
}
