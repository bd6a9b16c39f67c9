use std::time::Duration;

/// Default deadline for a single unit of work, from lock to commit.
pub const DEFAULT_UNIT_DEADLINE: Duration = Duration::from_secs(5);

/// How long a connection waits on SQLite's write lock before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// Runtime configuration for the store and the ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// SQLite URL, e.g. `sqlite:coffer.db`.
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    /// Upper bound on a unit of work. A unit still running when it elapses
    /// is rolled back instead of committed.
    pub unit_deadline: Duration,
}

impl LedgerConfig {
    /// Configuration for a database file at `path`, with default limits.
    pub fn for_path(path: &str) -> Self {
        Self {
            database_url: format!("sqlite:{}", path),
            ..Self::default()
        }
    }

    pub fn with_unit_deadline(mut self, deadline: Duration) -> Self {
        self.unit_deadline = deadline;
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:coffer.db".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            unit_deadline: DEFAULT_UNIT_DEADLINE,
        }
    }
}
