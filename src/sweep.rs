//! End-of-run removal of items whose image is permanently gone.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::batch::UndeliverableSet;

#[async_trait]
pub trait ItemDeleter: Send + Sync {
    /// Removes the given catalog ids from the active-items collection and
    /// returns the number of rows affected.
    async fn delete_items(&self, vinted_ids: &[String]) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Skipped,
    Deleted(u64),
    Failed(String),
}

pub struct DeletionSweep<'a> {
    deleter: &'a dyn ItemDeleter,
}

impl<'a> DeletionSweep<'a> {
    pub fn new(deleter: &'a dyn ItemDeleter) -> Self {
        Self { deleter }
    }

    /// One delete call for the whole set; a failure is logged and reported,
    /// never retried.
    pub async fn run(&self, undeliverable: &UndeliverableSet) -> SweepOutcome {
        if undeliverable.is_empty() {
            return SweepOutcome::Skipped;
        }
        match self.deleter.delete_items(undeliverable.ids()).await {
            Ok(rows) => {
                info!(
                    requested = undeliverable.len(),
                    deleted = rows,
                    "removed undeliverable items from catalog"
                );
                SweepOutcome::Deleted(rows)
            }
            Err(e) => {
                warn!(
                    requested = undeliverable.len(),
                    error = %format!("{e:#}"),
                    "deletion sweep failed"
                );
                SweepOutcome::Failed(format!("{e:#}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDeleter {
        calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl ItemDeleter for RecordingDeleter {
        async fn delete_items(&self, vinted_ids: &[String]) -> Result<u64> {
            self.calls.lock().unwrap().push(vinted_ids.to_vec());
            if self.fail {
                anyhow::bail!("connection reset");
            }
            Ok(vinted_ids.len() as u64)
        }
    }

    #[tokio::test]
    async fn empty_set_issues_no_call() {
        let deleter = RecordingDeleter::default();
        let out = DeletionSweep::new(&deleter).run(&UndeliverableSet::default()).await;
        assert_eq!(out, SweepOutcome::Skipped);
        assert!(deleter.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_call_with_all_ids() {
        let deleter = RecordingDeleter::default();
        let mut set = UndeliverableSet::default();
        set.insert("a");
        set.insert("b");
        set.insert("a");
        let out = DeletionSweep::new(&deleter).run(&set).await;
        assert_eq!(out, SweepOutcome::Deleted(2));
        assert_eq!(
            *deleter.calls.lock().unwrap(),
            vec![vec!["a".to_string(), "b".to_string()]]
        );
    }

    #[tokio::test]
    async fn failure_is_reported_not_raised() {
        let deleter = RecordingDeleter {
            fail: true,
            ..Default::default()
        };
        let mut set = UndeliverableSet::default();
        set.insert("x");
        let out = DeletionSweep::new(&deleter).run(&set).await;
        assert!(matches!(out, SweepOutcome::Failed(msg) if msg.contains("connection reset")));
        assert_eq!(deleter.calls.lock().unwrap().len(), 1);
    }
}
