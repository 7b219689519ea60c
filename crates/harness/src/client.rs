use std::sync::{Arc, Once};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use lockdoc_core::ManualClock;
use lockdoc_engine::{CollectionConfig, DocumentClient, EngineError};
use lockdoc_storage::{DocumentStore, MemoryStore, SqliteStore};

static TRACING: Once = Once::new();

/// Installs a fmt subscriber once per test binary. `RUST_LOG` overrides the
/// default `warn` filter.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A document client over a hand-driven clock.
pub struct TestClient<S: DocumentStore> {
    pub client: DocumentClient<S, Arc<ManualClock>>,
    pub clock: Arc<ManualClock>,
    _dir: Option<TempDir>,
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

impl TestClient<MemoryStore> {
    pub fn memory(config: CollectionConfig) -> Result<Self, EngineError> {
        Self::with_store(MemoryStore::new(), config)
    }
}

impl TestClient<SqliteStore> {
    /// Backed by a sqlite file in a temporary directory that lives as long
    /// as the client.
    pub fn sqlite(config: CollectionConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let path = dir.path().join("lockdoc.db");
        let store = SqliteStore::open(&path.to_string_lossy())?;
        let mut client = Self::with_store(store, config)?;
        client._dir = Some(dir);
        Ok(client)
    }
}

impl<S: DocumentStore> TestClient<S> {
    pub fn with_store(store: S, config: CollectionConfig) -> Result<Self, EngineError> {
        init_tracing();
        let clock = Arc::new(ManualClock::new(epoch()));
        Ok(Self {
            client: DocumentClient::new(store, Arc::clone(&clock), config)?,
            clock,
            _dir: None,
        })
    }

    /// Moves the clock one second forward and returns the new time.
    pub fn tick(&self) -> DateTime<Utc> {
        self.clock.advance(Duration::seconds(1))
    }

    pub fn now(&self) -> DateTime<Utc> {
        lockdoc_core::Clock::now(self.clock.as_ref())
    }
}
