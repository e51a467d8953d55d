//! Durable, atomically-written per-plan state with transactional
//! read-modify-write semantics.
//!
//! One JSON file per plan under the state directory. Every save writes the
//! full record to a sibling `.tmp` path and renames it over the target, so
//! a crash mid-write leaves the previous state intact. One async lock per
//! plan_id serializes read-modify-write sequences; different plans proceed
//! concurrently.

use crate::errors::StateError;
use crate::state::model::ExecutionState;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

pub struct StateStore {
    state_dir: PathBuf,
    /// Per-plan locks, created lazily. The std mutex guards only the
    /// registry itself and is never held across an await point.
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn plan_path(&self, plan_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", plan_id))
    }

    /// Get (or lazily create) the lock for a plan. Two callers racing on a
    /// new plan_id resolve through the registry mutex to the same lock.
    fn plan_lock(&self, plan_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks
            .entry(plan_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load a plan's state, synthesizing and persisting a fresh record if
    /// none exists yet.
    pub async fn load(&self, plan_id: &str) -> Result<ExecutionState, StateError> {
        let lock = self.plan_lock(plan_id);
        let _guard = lock.lock().await;
        self.load_locked(plan_id).await
    }

    /// Persist a plan's state. Recomputes the derived overall status and
    /// bumps `updated_at`; callers never set those directly.
    pub async fn save(&self, plan_id: &str, state: &mut ExecutionState) -> Result<(), StateError> {
        let lock = self.plan_lock(plan_id);
        let _guard = lock.lock().await;
        self.save_locked(plan_id, state).await
    }

    /// Run a read-modify-write transaction on a plan's state.
    ///
    /// Loads under the plan lock, yields the state to `f` for in-place
    /// mutation, and persists the in-memory object only if `f` returns Ok.
    /// On error the on-disk state is untouched and the lock is still
    /// released.
    pub async fn transaction<T>(
        &self,
        plan_id: &str,
        f: impl FnOnce(&mut ExecutionState) -> Result<T>,
    ) -> Result<T> {
        let lock = self.plan_lock(plan_id);
        let _guard = lock.lock().await;

        let mut state = self.load_locked(plan_id).await?;
        let value = f(&mut state)?;
        self.save_locked(plan_id, &mut state).await?;
        Ok(value)
    }

    /// List plan ids that have a state file.
    pub fn list_plans(&self) -> Result<Vec<String>, StateError> {
        let pattern = self.state_dir.join("*.json");
        let mut plans: Vec<String> = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| StateError::ReadFailed {
                path: self.state_dir.clone(),
                source: std::io::Error::other(e),
            })?
            .filter_map(|entry| entry.ok())
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        plans.sort();
        Ok(plans)
    }

    /// Remove a plan's state file. Explicit operator cleanup; never called
    /// automatically.
    pub async fn delete(&self, plan_id: &str) -> Result<(), StateError> {
        let lock = self.plan_lock(plan_id);
        let _guard = lock.lock().await;

        let path = self.plan_path(plan_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::WriteFailed { path, source: e }),
        }
    }

    async fn load_locked(&self, plan_id: &str) -> Result<ExecutionState, StateError> {
        let path = self.plan_path(plan_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StateError::ParseFailed { path, source: e }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut state = ExecutionState::new(plan_id);
                self.save_locked(plan_id, &mut state).await?;
                Ok(state)
            }
            Err(e) => Err(StateError::ReadFailed { path, source: e }),
        }
    }

    async fn save_locked(&self, plan_id: &str, state: &mut ExecutionState) -> Result<(), StateError> {
        state.updated_at = Utc::now();
        state.status = state.compute_status();

        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .map_err(|e| StateError::DirFailed {
                path: self.state_dir.clone(),
                source: e,
            })?;

        let path = self.plan_path(plan_id);
        let tmp = self.state_dir.join(format!("{}.json.tmp", plan_id));
        let bytes =
            serde_json::to_vec_pretty(state).expect("execution state is always serializable");

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StateError::WriteFailed {
                path: tmp.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StateError::RenameFailed {
                from: tmp,
                to: path,
                source: e,
            })?;
        Ok(())
    }
}
