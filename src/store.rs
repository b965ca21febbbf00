//! Durable storage for runs.
//!
//! [`RunStore`] is the seam between the verifier and persistence. Two
//! implementations ship with the crate: [`MemoryRunStore`] for tests and
//! throwaway deployments, and [`RedbRunStore`], a durable store where every
//! call is its own redb transaction touching only the run it names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::protocol::UserId;
use crate::run::{Run, RunId};

/// Errors raised by a [`RunStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened, read or committed.
    #[error("store database error: {0}")]
    Database(#[from] redb::Error),

    /// A blocking store task failed to complete.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored run could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Insert of an existing id, or update of a missing one.
    #[error("store conflict: {0}")]
    Conflict(String),
}

/// Persistence for runs.
///
/// Implementations only need per-call atomicity; the verifier serializes
/// read-modify-write sequences on the same run itself.
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    /// Persist a new run.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if a run with the same id exists.
    async fn insert(&self, run: Run) -> Result<(), StoreError>;

    /// Look up a run by id regardless of owner or status.
    async fn get(&self, run_id: &str) -> Result<Option<Run>, StoreError>;

    /// Replace a stored run.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if no run with that id exists.
    async fn update(&self, run: Run) -> Result<(), StoreError>;

    /// Most recently created `IN_PROGRESS` run owned by `user_id`.
    async fn latest_in_progress(&self, user_id: UserId) -> Result<Option<Run>, StoreError>;

    /// The run `run_id` if it belongs to `user_id` and is still in progress.
    async fn find_in_progress(
        &self,
        run_id: &str,
        user_id: UserId,
    ) -> Result<Option<Run>, StoreError> {
        Ok(self
            .get(run_id)
            .await?
            .filter(|run| run.user_id == user_id && run.is_in_progress()))
    }
}

/// Runs keyed by id, remembering creation order.
#[derive(Debug, Default)]
struct RunTable {
    runs: HashMap<RunId, Run>,
    order: Vec<RunId>,
}

impl RunTable {
    fn insert(&mut self, run: Run) -> Result<(), StoreError> {
        if self.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        self.order.push(run.id.clone());
        self.runs.insert(run.id.clone(), run);
        Ok(())
    }

    fn update(&mut self, run: Run) -> Result<(), StoreError> {
        match self.runs.get_mut(&run.id) {
            Some(slot) => {
                *slot = run;
                Ok(())
            }
            None => Err(StoreError::Conflict(format!("run {} does not exist", run.id))),
        }
    }

    fn get(&self, run_id: &str) -> Option<Run> {
        self.runs.get(run_id).cloned()
    }

    fn latest_in_progress(&self, user_id: UserId) -> Option<Run> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.runs.get(id))
            .find(|run| run.user_id == user_id && run.is_in_progress())
            .cloned()
    }
}

/// In-memory store. Clones share the same runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunStore {
    table: Arc<RwLock<RunTable>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs in any status.
    pub async fn len(&self) -> usize {
        self.table.read().await.runs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert(&self, run: Run) -> Result<(), StoreError> {
        self.table.write().await.insert(run)
    }

    async fn get(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self.table.read().await.get(run_id))
    }

    async fn update(&self, run: Run) -> Result<(), StoreError> {
        self.table.write().await.update(run)
    }

    async fn latest_in_progress(&self, user_id: UserId) -> Result<Option<Run>, StoreError> {
        Ok(self.table.read().await.latest_in_progress(user_id))
    }
}

/// Table: runs
/// Key: run id
/// Value: JSON-encoded [`Run`]
const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Table: active_runs
/// Key: (user_id: u64, creation seq: u64) as big-endian bytes [16 bytes]
/// Value: run id of an `IN_PROGRESS` run
const ACTIVE_RUNS: TableDefinition<&[u8], &str> = TableDefinition::new("active_runs");

/// Table: meta
/// Key: counter name
/// Value: counter
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_SEQ: &str = "next_seq";

fn db_err(e: impl Into<redb::Error>) -> StoreError {
    StoreError::Database(e.into())
}

fn active_key(user_id: UserId, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    let (user, order) = key.split_at_mut(8);
    user.copy_from_slice(&user_id.to_be_bytes());
    order.copy_from_slice(&seq.to_be_bytes());
    key
}

/// Run a synchronous database call off the async runtime.
async fn blocking<T, F>(op: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

/// Durable store backed by redb.
///
/// Runs are keyed by id, so a checkpoint writes one record in its own
/// transaction. An index of in-progress runs per user answers
/// [`latest_in_progress`](RunStore::latest_in_progress) without a scan.
/// Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbRunStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbRunStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbRunStore {
    /// Open or create the database at `path`, creating its tables.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] if the file cannot be opened as a redb
    /// database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db = {
            let path = path.clone();
            blocking(move || create_database(&path)).await?
        };
        info!(path = %path.display(), "run store opened");
        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_db<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        blocking(move || op(&db)).await
    }
}

fn create_database(path: &Path) -> Result<Database, StoreError> {
    let db = Database::create(path).map_err(db_err)?;
    let txn = db.begin_write().map_err(db_err)?;
    {
        let _ = txn.open_table(RUNS).map_err(db_err)?;
        let _ = txn.open_table(ACTIVE_RUNS).map_err(db_err)?;
        let _ = txn.open_table(META).map_err(db_err)?;
    }
    txn.commit().map_err(db_err)?;
    Ok(db)
}

fn insert_run(db: &Database, run: &Run) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(run)?;
    let txn = db.begin_write().map_err(db_err)?;
    {
        let mut runs = txn.open_table(RUNS).map_err(db_err)?;
        if runs.get(run.id.as_str()).map_err(db_err)?.is_some() {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        runs.insert(run.id.as_str(), bytes.as_slice())
            .map_err(db_err)?;

        let mut meta = txn.open_table(META).map_err(db_err)?;
        let seq = meta
            .get(NEXT_SEQ)
            .map_err(db_err)?
            .map_or(0, |v| v.value());
        meta.insert(NEXT_SEQ, seq.saturating_add(1)).map_err(db_err)?;

        if run.is_in_progress() {
            let mut active = txn.open_table(ACTIVE_RUNS).map_err(db_err)?;
            let key = active_key(run.user_id, seq);
            active
                .insert(key.as_slice(), run.id.as_str())
                .map_err(db_err)?;
        }
    }
    txn.commit().map_err(db_err)?;
    Ok(())
}

fn update_run(db: &Database, run: &Run) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(run)?;
    let txn = db.begin_write().map_err(db_err)?;
    {
        let mut runs = txn.open_table(RUNS).map_err(db_err)?;
        if runs.get(run.id.as_str()).map_err(db_err)?.is_none() {
            return Err(StoreError::Conflict(format!("run {} does not exist", run.id)));
        }
        runs.insert(run.id.as_str(), bytes.as_slice())
            .map_err(db_err)?;

        if !run.is_in_progress() {
            let mut active = txn.open_table(ACTIVE_RUNS).map_err(db_err)?;
            let start = active_key(run.user_id, 0);
            let end = active_key(run.user_id, u64::MAX);
            let mut stale = Vec::new();
            for entry in active
                .range(start.as_slice()..=end.as_slice())
                .map_err(db_err)?
            {
                let (key, id) = entry.map_err(db_err)?;
                if id.value() == run.id {
                    stale.push(key.value().to_vec());
                }
            }
            for key in stale {
                active.remove(key.as_slice()).map_err(db_err)?;
            }
        }
    }
    txn.commit().map_err(db_err)?;
    Ok(())
}

fn load_run(db: &Database, run_id: &str) -> Result<Option<Run>, StoreError> {
    let txn = db.begin_read().map_err(db_err)?;
    let runs = txn.open_table(RUNS).map_err(db_err)?;
    let Some(bytes) = runs.get(run_id).map_err(db_err)? else {
        return Ok(None);
    };
    let run: Run = serde_json::from_slice(bytes.value())?;
    Ok(Some(run))
}

fn load_latest_in_progress(db: &Database, user_id: UserId) -> Result<Option<Run>, StoreError> {
    let txn = db.begin_read().map_err(db_err)?;
    let active = txn.open_table(ACTIVE_RUNS).map_err(db_err)?;
    let runs = txn.open_table(RUNS).map_err(db_err)?;

    let start = active_key(user_id, 0);
    let end = active_key(user_id, u64::MAX);
    let mut ids = Vec::new();
    for entry in active
        .range(start.as_slice()..=end.as_slice())
        .map_err(db_err)?
    {
        let (_, id) = entry.map_err(db_err)?;
        ids.push(id.value().to_string());
    }

    for id in ids.iter().rev() {
        let Some(bytes) = runs.get(id.as_str()).map_err(db_err)? else {
            continue;
        };
        let run: Run = serde_json::from_slice(bytes.value())?;
        if run.is_in_progress() {
            return Ok(Some(run));
        }
    }
    Ok(None)
}

#[async_trait]
impl RunStore for RedbRunStore {
    async fn insert(&self, run: Run) -> Result<(), StoreError> {
        self.with_db(move |db| insert_run(db, &run)).await
    }

    async fn get(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let run_id = run_id.to_string();
        self.with_db(move |db| load_run(db, &run_id)).await
    }

    async fn update(&self, run: Run) -> Result<(), StoreError> {
        self.with_db(move |db| update_run(db, &run)).await
    }

    async fn latest_in_progress(&self, user_id: UserId) -> Result<Option<Run>, StoreError> {
        self.with_db(move |db| load_latest_in_progress(db, user_id))
            .await
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::run::RunStatus;

    #[tokio::test]
    async fn insert_get_update() {
        let store = MemoryRunStore::new();
        let mut run = Run::start(1, "S1".into(), None);
        store.insert(run.clone()).await.unwrap();
        assert_eq!(store.get(&run.id).await.unwrap(), Some(run.clone()));

        run.lines = 10;
        store.update(run.clone()).await.unwrap();
        assert_eq!(store.get(&run.id).await.unwrap().unwrap().lines, 10);
    }

    #[tokio::test]
    async fn conflicts() {
        let store = MemoryRunStore::new();
        let run = Run::start(1, "S1".into(), None);
        store.insert(run.clone()).await.unwrap();
        assert!(matches!(
            store.insert(run).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.update(Run::start(1, "S2".into(), None)).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn find_in_progress_filters_owner_and_status() {
        let store = MemoryRunStore::new();
        let mut run = Run::start(1, "S1".into(), None);
        store.insert(run.clone()).await.unwrap();

        assert!(store.find_in_progress(&run.id, 1).await.unwrap().is_some());
        assert!(store.find_in_progress(&run.id, 2).await.unwrap().is_none());

        run.status = RunStatus::Finished;
        store.update(run.clone()).await.unwrap();
        assert!(store.find_in_progress(&run.id, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_in_progress_prefers_newest() {
        let store = MemoryRunStore::new();
        let older = Run::start(1, "old".into(), None);
        let newer = Run::start(1, "new".into(), None);
        let other_user = Run::start(2, "x".into(), None);
        store.insert(older).await.unwrap();
        store.insert(newer.clone()).await.unwrap();
        store.insert(other_user).await.unwrap();

        let latest = store.latest_in_progress(1).await.unwrap().unwrap();
        assert_eq!(latest.id, newer.id);
        assert!(store.latest_in_progress(3).await.unwrap().is_none());
    }

    #[test]
    fn active_keys_sort_by_user_then_seq() {
        assert!(active_key(1, u64::MAX) < active_key(2, 0));
        assert!(active_key(7, 1) < active_key(7, 2));
        assert_eq!(&active_key(0x0102, 3)[..8], &0x0102u64.to_be_bytes());
    }

    #[tokio::test]
    async fn redb_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.redb");

        let mut run = Run::start(5, "S1".into(), None);
        {
            let store = RedbRunStore::open(&path).await.unwrap();
            store.insert(run.clone()).await.unwrap();
            run.score = 1000;
            run.lines = 10;
            store.update(run.clone()).await.unwrap();
        }

        let reopened = RedbRunStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(&run.id).await.unwrap(), Some(run.clone()));
        assert_eq!(
            reopened.latest_in_progress(5).await.unwrap().map(|r| r.id),
            Some(run.id)
        );
    }

    #[tokio::test]
    async fn redb_store_rejects_a_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.redb");
        std::fs::write(&path, b"{ this is not a database }").unwrap();
        assert!(matches!(
            RedbRunStore::open(&path).await,
            Err(StoreError::Database(_))
        ));
    }

    #[tokio::test]
    async fn redb_store_conflicts_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbRunStore::open(dir.path().join("runs.redb")).await.unwrap();

        let older = Run::start(1, "old".into(), None);
        let mut newer = Run::start(1, "new".into(), None);
        store.insert(older.clone()).await.unwrap();
        store.insert(newer.clone()).await.unwrap();
        store.insert(Run::start(2, "x".into(), None)).await.unwrap();

        assert!(matches!(
            store.insert(older.clone()).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.update(Run::start(1, "ghost".into(), None)).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(
            store.latest_in_progress(1).await.unwrap().map(|r| r.id),
            Some(newer.id.clone())
        );

        // Ending the newest run falls back to the older one.
        newer.status = RunStatus::Finished;
        store.update(newer.clone()).await.unwrap();
        assert_eq!(
            store.latest_in_progress(1).await.unwrap().map(|r| r.id),
            Some(older.id.clone())
        );
        assert_eq!(
            store.get(&newer.id).await.unwrap().unwrap().status,
            RunStatus::Finished
        );
        assert!(store.find_in_progress(&newer.id, 1).await.unwrap().is_none());
        assert!(store.latest_in_progress(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_writes_only_the_named_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbRunStore::open(dir.path().join("runs.redb")).await.unwrap();

        let mut finished = Vec::new();
        for i in 0..200u64 {
            let mut run = Run::start(i, format!("seed-{i}"), None);
            store.insert(run.clone()).await.unwrap();
            run.status = RunStatus::Abandoned;
            store.update(run.clone()).await.unwrap();
            finished.push(run);
        }
        let mut live = Run::start(9_999, "live".into(), None);
        store.insert(live.clone()).await.unwrap();
        live.lines = 10;
        live.score = 1000;
        store.update(live.clone()).await.unwrap();

        assert_eq!(store.get(&live.id).await.unwrap(), Some(live.clone()));
        for run in &finished {
            assert_eq!(store.get(&run.id).await.unwrap().as_ref(), Some(run));
            assert!(store.latest_in_progress(run.user_id).await.unwrap().is_none());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_runs_update_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbRunStore::open(dir.path().join("runs.redb")).await.unwrap();

        let mut runs = Vec::new();
        for user in 0..16u64 {
            let run = Run::start(user, "S".into(), None);
            store.insert(run.clone()).await.unwrap();
            runs.push(run);
        }

        let tasks: Vec<_> = runs
            .into_iter()
            .map(|mut run| {
                let store = store.clone();
                tokio::spawn(async move {
                    for lines in 1..=10 {
                        run.lines = lines;
                        store.update(run.clone()).await.unwrap();
                    }
                    run
                })
            })
            .collect();

        for task in tasks {
            let run = task.await.unwrap();
            assert_eq!(store.get(&run.id).await.unwrap().unwrap().lines, 10);
            assert_eq!(
                store.latest_in_progress(run.user_id).await.unwrap().map(|r| r.id),
                Some(run.id)
            );
        }
    }
}
