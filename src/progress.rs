//! Pagination cursor and the store that persists it between invocations.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{ExtractionError, Result};

/// Persisted `(total, pointer)` pair for one document.
///
/// `total` is set once on the first invocation and never recomputed for the
/// same document; `pointer` only moves forward and never passes `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationState {
    #[serde(default)]
    pub total: Option<usize>,
    #[serde(default)]
    pub pointer: Option<usize>,
}

impl PaginationState {
    pub fn new(total: usize, pointer: usize) -> Self {
        Self {
            total: Some(total),
            pointer: Some(pointer),
        }
    }

    /// Index of the next context node to process.
    pub fn start(&self) -> usize {
        self.pointer.unwrap_or(0)
    }

    /// Every context node has been visited.
    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if self.start() >= total)
    }

    /// Context nodes left to process, once the total is known.
    pub fn remaining(&self) -> Option<usize> {
        self.total.map(|total| total.saturating_sub(self.start()))
    }
}

/// Host storage for pagination progress.
pub trait ProgressStore {
    fn get(&self) -> Result<PaginationState>;

    fn set(&self, state: PaginationState) -> Result<()>;

    /// Overall progress for progress bars.
    fn report_progress(&self, total: usize, pointer: usize) -> Result<()>;
}

/// In-memory progress store for tests and single-process hosts.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    state: RwLock<PaginationState>,
    reports: RwLock<Vec<(usize, usize)>>,
}

fn poisoned<T>(_: T) -> ExtractionError {
    ExtractionError::Progress("progress store lock poisoned".into())
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a previously persisted state.
    pub fn with_state(state: PaginationState) -> Self {
        Self {
            state: RwLock::new(state),
            reports: RwLock::new(Vec::new()),
        }
    }

    /// Forget all progress, for extraction over a new document.
    pub fn reset(&self) -> Result<()> {
        *self.state.write().map_err(poisoned)? = PaginationState::default();
        self.reports.write().map_err(poisoned)?.clear();
        Ok(())
    }

    /// Every `(total, pointer)` report received so far.
    pub fn reports(&self) -> Result<Vec<(usize, usize)>> {
        Ok(self.reports.read().map_err(poisoned)?.clone())
    }
}

impl ProgressStore for MemoryProgressStore {
    fn get(&self) -> Result<PaginationState> {
        Ok(*self.state.read().map_err(poisoned)?)
    }

    fn set(&self, state: PaginationState) -> Result<()> {
        *self.state.write().map_err(poisoned)? = state;
        Ok(())
    }

    fn report_progress(&self, total: usize, pointer: usize) -> Result<()> {
        self.reports.write().map_err(poisoned)?.push((total, pointer));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_arithmetic() {
        let fresh = PaginationState::default();
        assert_eq!(fresh.start(), 0);
        assert!(!fresh.is_complete());
        assert_eq!(fresh.remaining(), None);

        let midway = PaginationState::new(5, 2);
        assert_eq!(midway.remaining(), Some(3));
        assert!(!midway.is_complete());
        assert!(PaginationState::new(5, 5).is_complete());
        assert!(PaginationState::new(0, 0).is_complete());
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryProgressStore::new();
        assert_eq!(store.get().unwrap(), PaginationState::default());

        store.set(PaginationState::new(5, 2)).unwrap();
        store.report_progress(5, 2).unwrap();
        assert_eq!(store.get().unwrap().pointer, Some(2));
        assert_eq!(store.reports().unwrap(), vec![(5, 2)]);

        store.reset().unwrap();
        assert_eq!(store.get().unwrap(), PaginationState::default());
        assert!(store.reports().unwrap().is_empty());
    }

    #[test]
    fn test_state_deserializes_partial_json() {
        let state: PaginationState = serde_json::from_str(r#"{"total": 3}"#).unwrap();
        assert_eq!(state, PaginationState { total: Some(3), pointer: None });
    }
}
