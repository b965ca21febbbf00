//! Run integrity verifier: start, current, checkpoint and end.
//!
//! Stored score and level only ever come from server arithmetic over
//! line deltas. Mutating calls must present the run token, and every
//! read-compute-write on one run happens under that run's lock so two
//! concurrent checkpoints cannot both count the same lines.
//!
//! Lookup failures are checked before the token: a finished run, someone
//! else's run and a missing run all answer [`RunError::NotFound`].

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error_codes::ErrorCode;
use crate::protocol::UserId;
use crate::run::{
    now_ms, Checkpoint, CheckpointOutcome, EndOutcome, Run, RunId, RunStatus, StartRunRequest,
    StartedRun,
};
use crate::scoring;
use crate::store::{RunStore, StoreError};
use crate::token::RunTokenSigner;

/// Default cap on the serialized size of a run's initial state blob.
pub const DEFAULT_MAX_STATE_BYTES: usize = 50_000;

/// Errors returned by [`RunVerifier`] operations.
#[derive(Debug, Error)]
pub enum RunError {
    /// The request payload failed validation.
    #[error("invalid input: {message}")]
    Validation {
        /// Wire name of the offending field, when known.
        field: Option<String>,
        message: String,
    },

    /// No verified caller identity.
    #[error("caller identity missing")]
    Unauthenticated,

    /// No in-progress run with this id for this caller.
    #[error("run not found")]
    NotFound,

    /// The run token is missing or does not match the run.
    #[error("run token does not match")]
    Forbidden,

    /// The state blob exceeds the configured cap.
    #[error("state blob is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RunError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::InvalidInput,
            Self::Unauthenticated => ErrorCode::Unauthorized,
            Self::NotFound => ErrorCode::RunNotFound,
            Self::Forbidden => ErrorCode::InvalidRunToken,
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::Store(_) => ErrorCode::StorageError,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    /// Internal faults whose detail must not reach the caller.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

type RunLock = Arc<Mutex<()>>;

/// Applies run operations against a [`RunStore`].
pub struct RunVerifier<S> {
    store: Arc<S>,
    signer: RunTokenSigner,
    max_state_bytes: usize,
    locks: Arc<Mutex<HashMap<RunId, RunLock>>>,
}

impl<S> Clone for RunVerifier<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            signer: self.signer.clone(),
            max_state_bytes: self.max_state_bytes,
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<S> std::fmt::Debug for RunVerifier<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunVerifier")
            .field("signer", &self.signer)
            .field("max_state_bytes", &self.max_state_bytes)
            .finish_non_exhaustive()
    }
}

impl<S: RunStore> RunVerifier<S> {
    pub fn new(store: S, signer: RunTokenSigner) -> Self {
        Self {
            store: Arc::new(store),
            signer,
            max_state_bytes: DEFAULT_MAX_STATE_BYTES,
            locks: Arc::default(),
        }
    }

    /// Override the state blob cap.
    #[must_use]
    pub fn with_max_state_bytes(mut self, limit: usize) -> Self {
        self.max_state_bytes = limit;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn signer(&self) -> &RunTokenSigner {
        &self.signer
    }

    /// Create a new `IN_PROGRESS` run for `user_id` and issue its token.
    ///
    /// # Errors
    ///
    /// [`RunError::PayloadTooLarge`] if the serialized state exceeds the cap,
    /// [`RunError::Validation`] for a bad seed or state, or
    /// [`RunError::Store`].
    pub async fn start(
        &self,
        user_id: UserId,
        request: StartRunRequest,
    ) -> Result<StartedRun, RunError> {
        if let Some(state) = &request.state {
            let size = serde_json::to_vec(state)
                .map_err(|e| RunError::Validation {
                    field: Some("state".to_string()),
                    message: e.to_string(),
                })?
                .len();
            if size > self.max_state_bytes {
                return Err(RunError::PayloadTooLarge {
                    size,
                    limit: self.max_state_bytes,
                });
            }
        }
        request.validate()?;

        let run = Run::start(user_id, request.seed, request.state);
        self.store.insert(run.clone()).await?;
        let run_token = self.signer.sign(&run.id, run.user_id, &run.seed);
        info!(run_id = %run.id, user_id, "run started");
        Ok(StartedRun { run, run_token })
    }

    /// The caller's in-progress run, if any.
    ///
    /// # Errors
    ///
    /// [`RunError::Store`] if the lookup fails.
    pub async fn current(&self, user_id: UserId) -> Result<Option<Run>, RunError> {
        Ok(self.store.latest_in_progress(user_id).await?)
    }

    /// Advance a run by the lines reported in `checkpoint`.
    ///
    /// The returned score, lines and level are the stored values, never the
    /// client's. On any error the stored run is unchanged.
    ///
    /// # Errors
    ///
    /// [`RunError::NotFound`], then [`RunError::Forbidden`], then
    /// [`RunError::Store`].
    pub async fn checkpoint(
        &self,
        user_id: UserId,
        run_id: &str,
        token: Option<&str>,
        checkpoint: Checkpoint,
    ) -> Result<CheckpointOutcome, RunError> {
        self.with_run_lock(run_id, async move {
            let mut run = self.authorize(user_id, run_id, token).await?;

            let multiplier = scoring::effective_multiplier(
                checkpoint.score_multiplier,
                &checkpoint.mutations,
                checkpoint.bombs,
            );
            let update =
                scoring::apply_checkpoint(run.score, run.lines, checkpoint.lines, multiplier);

            run.score = update.score;
            run.lines = update.lines;
            run.level = update.level;
            run.perks = checkpoint.perks;
            run.mutations = checkpoint.mutations;
            run.bombs = checkpoint.bombs;
            run.time_freeze_charges = checkpoint.time_freeze_charges;
            run.chaos_mode = checkpoint.chaos_mode;
            run.gravity_multiplier = checkpoint.gravity_multiplier;
            run.score_multiplier = checkpoint.score_multiplier;
            run.track_bombs_used(checkpoint.bombs_used);

            self.store.update(run).await?;
            debug!(run_id, score = update.score, lines = update.lines, "checkpoint applied");
            Ok(CheckpointOutcome {
                success: true,
                score: update.score.to_string(),
                lines: update.lines,
                level: update.level,
            })
        })
        .await
    }

    /// Close a run as `FINISHED` or `ABANDONED`. The run is immutable
    /// afterwards.
    ///
    /// # Errors
    ///
    /// [`RunError::Validation`] if `status` is `IN_PROGRESS`, otherwise the
    /// same errors as [`checkpoint`](Self::checkpoint).
    pub async fn end(
        &self,
        user_id: UserId,
        run_id: &str,
        token: Option<&str>,
        status: RunStatus,
    ) -> Result<EndOutcome, RunError> {
        if !status.is_terminal() {
            return Err(RunError::Validation {
                field: Some("status".to_string()),
                message: "must be FINISHED or ABANDONED".to_string(),
            });
        }
        self.with_run_lock(run_id, async move {
            let mut run = self.authorize(user_id, run_id, token).await?;

            run.score = scoring::final_score(run.score, status, &run.mutations, run.bombs_used());
            run.status = status;
            run.ended_at_ms = Some(now_ms());
            let score = run.score;

            self.store.update(run).await?;
            info!(run_id, ?status, score, "run ended");
            Ok(EndOutcome { success: true })
        })
        .await
    }

    /// Load the caller's in-progress run and check the token, in that order.
    async fn authorize(
        &self,
        user_id: UserId,
        run_id: &str,
        token: Option<&str>,
    ) -> Result<Run, RunError> {
        let run = self
            .store
            .find_in_progress(run_id, user_id)
            .await?
            .ok_or(RunError::NotFound)?;
        let valid = token.is_some_and(|t| self.signer.verify(&run.id, run.user_id, &run.seed, t));
        if !valid {
            warn!(run_id, user_id, "run token mismatch");
            return Err(RunError::Forbidden);
        }
        Ok(run)
    }

    /// Run `op` while holding the per-run lock, dropping the lock entry
    /// afterwards if nobody else is waiting on it.
    async fn with_run_lock<T, F>(&self, run_id: &str, op: F) -> Result<T, RunError>
    where
        F: std::future::Future<Output = Result<T, RunError>>,
    {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(run_id.to_string()).or_default())
        };
        let result = {
            let _guard = lock.lock().await;
            op.await
        };

        let mut locks = self.locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(run_id);
        }
        result
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
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
    use crate::store::MemoryRunStore;
    use serde_json::json;

    fn verifier() -> RunVerifier<MemoryRunStore> {
        RunVerifier::new(MemoryRunStore::new(), RunTokenSigner::new("test-secret"))
    }

    fn start_request(seed: &str) -> StartRunRequest {
        StartRunRequest {
            seed: seed.to_string(),
            state: None,
        }
    }

    #[tokio::test]
    async fn oversize_state_is_rejected_before_storing() {
        let v = verifier().with_max_state_bytes(16);
        let request = StartRunRequest {
            seed: "S1".into(),
            state: Some(json!({"board": "x".repeat(64)})),
        };
        let err = v.start(1, request).await.unwrap_err();
        assert!(matches!(err, RunError::PayloadTooLarge { limit: 16, .. }));
        assert_eq!(err.code().http_status(), 413);
        assert!(v.store().is_empty().await);
    }

    #[tokio::test]
    async fn state_at_exact_limit_is_accepted() {
        let state = json!({"k": "v"});
        let size = serde_json::to_vec(&state).unwrap().len();
        let v = verifier().with_max_state_bytes(size);
        let request = StartRunRequest {
            seed: "S1".into(),
            state: Some(state),
        };
        assert!(v.start(1, request).await.is_ok());
    }

    #[tokio::test]
    async fn token_matches_signer() {
        let v = verifier();
        let started = v.start(9, start_request("S1")).await.unwrap();
        assert!(v
            .signer()
            .verify(&started.run.id, 9, "S1", &started.run_token));
    }

    #[tokio::test]
    async fn missing_token_is_forbidden() {
        let v = verifier();
        let started = v.start(1, start_request("S1")).await.unwrap();
        let err = v
            .checkpoint(1, &started.run.id, None, Checkpoint::lines(4))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Forbidden));
    }

    #[tokio::test]
    async fn existence_is_checked_before_token() {
        let v = verifier();
        let err = v
            .checkpoint(1, "no-such-run", Some("bad"), Checkpoint::lines(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NotFound));
    }

    #[tokio::test]
    async fn end_rejects_in_progress_status() {
        let v = verifier();
        let started = v.start(1, start_request("S1")).await.unwrap();
        let err = v
            .end(
                1,
                &started.run.id,
                Some(&started.run_token),
                RunStatus::InProgress,
            )
            .await
            .unwrap_err();
        assert_eq!(err.field(), Some("status"));
    }

    #[tokio::test]
    async fn no_bomb_run_bonus_on_clean_finish() {
        let v = verifier();
        let started = v.start(1, start_request("S1")).await.unwrap();
        let token = started.run_token.as_str();
        let id = started.run.id.as_str();

        let mut cp = Checkpoint::lines(10);
        cp.mutations = vec![scoring::NO_BOMB_RUN.to_string()];
        v.checkpoint(1, id, Some(token), cp).await.unwrap();
        v.end(1, id, Some(token), RunStatus::Finished).await.unwrap();

        let run = v.store().get(id).await.unwrap().unwrap();
        assert_eq!(run.score, 2000);
        assert_eq!(run.status, RunStatus::Finished);
        assert!(run.ended_at_ms.is_some());
    }

    #[tokio::test]
    async fn reported_bomb_use_blocks_the_bonus() {
        let v = verifier();
        let started = v.start(1, start_request("S1")).await.unwrap();
        let token = started.run_token.as_str();
        let id = started.run.id.as_str();

        let mut cp = Checkpoint::lines(10);
        cp.mutations = vec![scoring::NO_BOMB_RUN.to_string()];
        cp.bombs_used = 1;
        v.checkpoint(1, id, Some(token), cp.clone()).await.unwrap();
        cp.bombs_used = 0;
        v.checkpoint(1, id, Some(token), cp).await.unwrap();
        v.end(1, id, Some(token), RunStatus::Finished).await.unwrap();

        let run = v.store().get(id).await.unwrap().unwrap();
        assert_eq!(run.bombs_used(), 1);
        assert_eq!(run.score, 1000);
    }

    #[tokio::test]
    async fn zero_bomb_boost_doubles_checkpoint_points() {
        let v = verifier();
        let started = v.start(1, start_request("S1")).await.unwrap();
        let mut cp = Checkpoint::lines(1);
        cp.mutations = vec![scoring::ZERO_BOMB_BOOST.to_string()];
        let outcome = v
            .checkpoint(1, &started.run.id, Some(&started.run_token), cp)
            .await
            .unwrap();
        assert_eq!(outcome.score, "200");
    }

    #[tokio::test]
    async fn lock_entries_are_released() {
        let v = verifier();
        let started = v.start(1, start_request("S1")).await.unwrap();
        v.checkpoint(
            1,
            &started.run.id,
            Some(&started.run_token),
            Checkpoint::lines(3),
        )
        .await
        .unwrap();
        let _ = v
            .checkpoint(1, "ghost", None, Checkpoint::lines(3))
            .await;
        assert_eq!(v.lock_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_checkpoints_count_lines_once() {
        let v = verifier();
        let started = v.start(1, start_request("S1")).await.unwrap();
        let id = started.run.id.clone();
        let token = started.run_token.clone();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let v = v.clone();
            let id = id.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                v.checkpoint(1, &id, Some(&token), Checkpoint::lines(10))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let run = v.store().get(&id).await.unwrap().unwrap();
        assert_eq!(run.lines, 10);
        assert_eq!(run.score, 1000);
    }
}
