//! SQLite connection for the ledger.

use crate::error::{LedgerError, Result};

use anyhow::Context as _;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use std::path::Path;
use std::time::Duration;

pub struct Db {
    pub sqlite: SqlitePool,
}

impl Db {
    /// Open (creating if needed) the database at `path` and apply migrations.
    ///
    /// Several front-end processes may open the same file; WAL plus a busy
    /// timeout lets their writes queue instead of failing.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create data directory: {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let sqlite = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(LedgerError::Connect)?;

        sqlx::migrate!("./migrations")
            .run(&sqlite)
            .await
            .map_err(LedgerError::Migration)?;

        tracing::debug!(path = %path.display(), "ledger database ready");
        Ok(Self { sqlite })
    }

    pub async fn close(&self) {
        self.sqlite.close().await;
    }
}
