//! Split reader/writer SQLite pools in WAL mode.
//!
//! SQLite allows only one writer at a time, so the writer pool is pinned
//! to a single connection: every write transaction is serialized, and that
//! serialization is the pessimistic-lock primitive the approval decision
//! path relies on. The reader pool holds up to `max_readers` connections;
//! under WAL its snapshot reads never block on the writer, which is what
//! keeps the timeout scanner from stalling decision writes.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Pool tunables, loaded from the environment by `OrchestratorConfig`.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// How long a connection waits for the writer before erroring out.
    pub busy_timeout: Duration,
    /// Connection cap for the snapshot reader pool.
    pub max_readers: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
            max_readers: 8,
        }
    }
}

/// Reader/writer pool pair for one SQLite database.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open both pools with the given tunables and run migrations.
    ///
    /// The writer opens first (creating the database file if needed) and
    /// migrates the schema; only then does the read-only pool open.
    pub async fn connect(
        database_url: &str,
        settings: PoolSettings,
    ) -> Result<Self, sqlx::Error> {
        let writer = open_pool(database_url, &settings, Role::Writer).await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = open_pool(database_url, &settings, Role::Reader).await?;
        Ok(Self { reader, writer })
    }

    /// Open with default tunables. Tests and tooling use this.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::connect(database_url, PoolSettings::default()).await
    }
}

enum Role {
    Writer,
    Reader,
}

async fn open_pool(
    database_url: &str,
    settings: &PoolSettings,
    role: Role,
) -> Result<SqlitePool, sqlx::Error> {
    let (read_only, max_connections) = match role {
        Role::Writer => (false, 1),
        Role::Reader => (true, settings.max_readers.max(1)),
    };

    let options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(settings.busy_timeout)
        // Only the writer may create the file; the reader opens what the
        // writer migrated.
        .create_if_missing(!read_only)
        .read_only(read_only);

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}
