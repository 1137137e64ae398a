//! Sequential multi-item migration runs with per-item status tracking.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command_client::MigrationLauncher;
use crate::error::BatchError;
use crate::types::{MigrationRequest, MigrationType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub source_node_id: String,
    pub target_node_id: String,
    pub migration_type: MigrationType,
    pub code_ids: Vec<String>,
}

impl BatchPlan {
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.source_node_id.trim().is_empty() {
            return Err(BatchError::Validation("source node is required".to_string()));
        }
        if self.target_node_id.trim().is_empty() {
            return Err(BatchError::Validation("target node is required".to_string()));
        }
        if self.source_node_id == self.target_node_id {
            return Err(BatchError::Validation(
                "source and target nodes must differ".to_string(),
            ));
        }
        if self.code_ids.is_empty() {
            return Err(BatchError::Validation(
                "at least one code package is required".to_string(),
            ));
        }
        Ok(())
    }

    fn request_for(&self, code_id: &str) -> MigrationRequest {
        MigrationRequest {
            code_id: code_id.to_string(),
            source_node_id: self.source_node_id.clone(),
            target_node_id: self.target_node_id.clone(),
            migration_type: self.migration_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub code_id: String,
    /// 1-based.
    pub position: usize,
    pub total: usize,
    pub status: BatchItemStatus,
    pub migration_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.items.len()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} succeeded", self.succeeded, self.total())?;
        if self.cancelled > 0 {
            write!(f, ", {} cancelled", self.cancelled)?;
        }
        Ok(())
    }
}

/// Drives a [`BatchPlan`] through a [`MigrationLauncher`], one call at a time.
///
/// Share it behind an `Arc` to observe items or cancel from another task
/// while [`run`](Self::run) is in progress.
pub struct BatchOrchestrator<L> {
    launcher: Arc<L>,
    pacing: Duration,
    running: AtomicBool,
    items: watch::Sender<Vec<BatchItem>>,
    cancel: Mutex<CancellationToken>,
}

/// Clears the running flag however `run` exits.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<L: MigrationLauncher> BatchOrchestrator<L> {
    pub fn new(launcher: Arc<L>, pacing: Duration) -> Self {
        let (items, _) = watch::channel(Vec::new());
        Self {
            launcher,
            pacing,
            running: AtomicBool::new(false),
            items,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Items of the current or most recent batch.
    pub fn items(&self) -> Vec<BatchItem> {
        self.items.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<BatchItem>> {
        self.items.subscribe()
    }

    /// Stop the running batch before its next call. The call in flight, if
    /// any, completes normally.
    pub fn cancel(&self) {
        // Same lock as the start of `run`, so a running batch always has its
        // own token in the slot.
        let token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_running() {
            return;
        }
        info!("Batch cancellation requested");
        token.cancel();
    }

    pub async fn run(&self, plan: BatchPlan) -> Result<BatchReport, BatchError> {
        plan.validate()?;
        let cancelled = CancellationToken::new();
        {
            let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(BatchError::AlreadyRunning);
            }
            *slot = cancelled.clone();
        }
        let _guard = RunningGuard(&self.running);

        let total = plan.code_ids.len();
        info!(
            "Starting batch of {} migrations {} -> {} ({})",
            total, plan.source_node_id, plan.target_node_id, plan.migration_type
        );
        self.items.send_replace(Vec::new());

        for (index, code_id) in plan.code_ids.iter().enumerate() {
            let position = index + 1;
            let mut item = BatchItem {
                code_id: code_id.clone(),
                position,
                total,
                status: BatchItemStatus::Pending,
                migration_id: None,
                error: None,
            };

            if cancelled.is_cancelled() {
                item.status = BatchItemStatus::Cancelled;
                self.items.send_modify(|items| items.push(item));
                continue;
            }

            self.items.send_modify(|items| items.push(item));
            self.set_item(index, |item| item.status = BatchItemStatus::InProgress);

            debug!("Batch item {}/{}: migrating {}", position, total, code_id);
            match self.launcher.launch(&plan.request_for(code_id)).await {
                Ok(migration) => {
                    debug!("Batch item {}/{} started migration {}", position, total, migration.id);
                    self.set_item(index, |item| {
                        item.status = BatchItemStatus::Completed;
                        item.migration_id = Some(migration.id);
                    });
                }
                Err(e) => {
                    warn!("Batch item {}/{} ({}) failed: {}", position, total, code_id, e);
                    self.set_item(index, |item| {
                        item.status = BatchItemStatus::Failed;
                        item.error = Some(e.user_message());
                    });
                }
            }

            if position < total {
                tokio::select! {
                    _ = cancelled.cancelled() => {}
                    _ = tokio::time::sleep(self.pacing) => {}
                }
            }
        }

        let items = self.items();
        let count = |status: BatchItemStatus| items.iter().filter(|i| i.status == status).count();
        let report = BatchReport {
            succeeded: count(BatchItemStatus::Completed),
            failed: count(BatchItemStatus::Failed),
            cancelled: count(BatchItemStatus::Cancelled),
            items,
        };
        info!("Batch finished: {}", report);
        Ok(report)
    }

    fn set_item(&self, index: usize, f: impl FnOnce(&mut BatchItem)) {
        self.items.send_modify(|items| {
            if let Some(item) = items.get_mut(index) {
                f(item);
            }
        });
    }
}
