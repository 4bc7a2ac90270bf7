//! Standalone relay for codesync collaboration.
//!
//! Configured through the environment:
//!
//! | Variable              | Default          |                                      |
//! |-----------------------|------------------|--------------------------------------|
//! | `CODESYNC_BIND`       | `127.0.0.1:9090` | listen address                       |
//! | `CODESYNC_MAX_PEERS`  | `100`            | peers per channel                    |
//! | `CODESYNC_HEARTBEAT`  | `30`             | seconds of silence before a drop     |
//! | `CODESYNC_PERSIST`    | `2000`           | `every-change`, `on-close` or ms     |
//! | `CODESYNC_CONTENT_DIR`| unset            | directory for converged file content |
//! | `CODESYNC_STATE_DIR`  | unset            | operation history (`rocksdb` feature)|
//!
//! Logging follows `RUST_LOG`.

use std::error::Error;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use log::info;

use codesync_collab::{FsContentStore, MemoryStateStore, PersistPolicy, RelayServer, ServerConfig};

/// Relay settings read from the environment.
#[derive(Debug, Clone)]
struct Settings {
    server: ServerConfig,
    content_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
}

impl Settings {
    fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let defaults = ServerConfig::default();
        let server = ServerConfig {
            bind_addr: lookup("CODESYNC_BIND").unwrap_or(defaults.bind_addr),
            max_peers_per_room: parse(&lookup, "CODESYNC_MAX_PEERS", defaults.max_peers_per_room)?,
            heartbeat_timeout_secs: parse(&lookup, "CODESYNC_HEARTBEAT", defaults.heartbeat_timeout_secs)?,
            persist_policy: parse(&lookup, "CODESYNC_PERSIST", defaults.persist_policy)?,
            ..defaults
        };
        Ok(Self {
            server,
            content_dir: lookup("CODESYNC_CONTENT_DIR").map(PathBuf::from),
            state_dir: lookup("CODESYNC_STATE_DIR").map(PathBuf::from),
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.parse().map_err(|e| format!("{name}: {e}")),
        None => Ok(default),
    }
}

#[cfg(feature = "rocksdb")]
fn with_state_store(server: RelayServer, dir: PathBuf) -> Result<RelayServer, Box<dyn Error>> {
    use codesync_collab::{RocksStateStore, StoreConfig};

    info!("Operation history in {}", dir.display());
    let store = RocksStateStore::open(StoreConfig {
        path: dir,
        ..StoreConfig::default()
    })?;
    Ok(server.with_state_store(Arc::new(store)))
}

#[cfg(not(feature = "rocksdb"))]
fn with_state_store(server: RelayServer, dir: PathBuf) -> Result<RelayServer, Box<dyn Error>> {
    log::warn!(
        "CODESYNC_STATE_DIR={} ignored: built without the rocksdb feature, history is kept in memory",
        dir.display()
    );
    Ok(server)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let settings = Settings::from_env()?;
    info!("Starting codesync relay ({:?})", settings.server.persist_policy);

    let mut server =
        RelayServer::new(settings.server).with_state_store(Arc::new(MemoryStateStore::new()));
    if let Some(dir) = settings.content_dir {
        info!("File content in {}", dir.display());
        server = server.with_content_store(Arc::new(FsContentStore::open(dir)?));
    }
    if let Some(dir) = settings.state_dir {
        server = with_state_store(server, dir)?;
    }

    server.run().await
}
