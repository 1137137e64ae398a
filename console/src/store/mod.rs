//! Entity store: the single source of truth for nodes, migrations, code
//! packages and the operator log.
//!
//! Every mutation swaps in a new collection behind an `Arc`, so a reader that
//! holds a [`StoreSnapshot`] never observes a half-applied change and can use
//! `Arc::ptr_eq` to tell which collections moved. Mutations run inside
//! `watch::Sender::send_if_modified`, which makes mutate-and-publish one step.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::types::{
    CodePackage, DemoEvent, LogEntry, LogLevel, LogTags, Migration, MigrationStatus, Node,
    NodeMetrics, NodeStatus, Timestamp,
};

pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// Result of merging a migration record into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No record existed for the id; one was appended.
    Inserted,
    /// A non-terminal record was replaced.
    Replaced,
    /// The existing record is terminal; the update was dropped.
    Frozen,
    /// `add_migration` only accepts PENDING records.
    NotPending,
    /// The record is PENDING but the store already has it IN_PROGRESS.
    Stale,
}

impl MergeOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced)
    }
}

/// Lifecycle position; a merge never moves a record backwards.
fn lifecycle_rank(status: MigrationStatus) -> u8 {
    match status {
        MigrationStatus::Pending => 0,
        MigrationStatus::InProgress => 1,
        MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Cancelled => 2,
    }
}

#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    /// Bumped once per effective mutation.
    pub version: u64,
    pub connected: bool,
    pub nodes: Arc<Vec<Node>>,
    pub migrations: Arc<Vec<Migration>>,
    pub code_packages: Arc<Vec<CodePackage>>,
    pub logs: Arc<VecDeque<LogEntry>>,
    pub demo_status: Option<Arc<DemoEvent>>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            version: 0,
            connected: false,
            nodes: Arc::new(Vec::new()),
            migrations: Arc::new(Vec::new()),
            code_packages: Arc::new(Vec::new()),
            logs: Arc::new(VecDeque::new()),
            demo_status: None,
        }
    }
}

impl StoreSnapshot {
    /// First IN_PROGRESS migration in insertion order. Several may be in
    /// progress at once; callers that highlight a single one get the oldest.
    pub fn active_migration(&self) -> Option<&Migration> {
        self.migrations
            .iter()
            .find(|m| m.status == MigrationStatus::InProgress)
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn migration(&self, migration_id: &str) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.id == migration_id)
    }

    pub fn code_package(&self, code_id: &str) -> Option<&CodePackage> {
        self.code_packages.iter().find(|c| c.id == code_id)
    }
}

pub struct EntityStore {
    state: watch::Sender<StoreSnapshot>,
    log_capacity: usize,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        let (state, _) = watch::channel(StoreSnapshot::default());
        Self {
            state,
            log_capacity: log_capacity.max(1),
        }
    }

    pub fn log_capacity(&self) -> usize {
        self.log_capacity
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.borrow().clone()
    }

    /// Change notifications; the receiver always sees the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    pub fn active_migration(&self) -> Option<Migration> {
        self.state.borrow().active_migration().cloned()
    }

    pub fn node_by_id(&self, node_id: &str) -> Option<Node> {
        self.state.borrow().node(node_id).cloned()
    }

    pub fn migration_by_id(&self, migration_id: &str) -> Option<Migration> {
        self.state.borrow().migration(migration_id).cloned()
    }

    pub fn code_package_by_id(&self, code_id: &str) -> Option<CodePackage> {
        self.state.borrow().code_package(code_id).cloned()
    }

    fn modify(&self, f: impl FnOnce(&mut StoreSnapshot) -> bool) -> bool {
        self.state.send_if_modified(|snapshot| {
            let changed = f(snapshot);
            if changed {
                snapshot.version += 1;
            }
            changed
        })
    }

    pub fn set_connected(&self, connected: bool) -> bool {
        self.modify(|s| {
            if s.connected == connected {
                return false;
            }
            s.connected = connected;
            true
        })
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Replace the whole node collection with a topology snapshot. Duplicate
    /// ids collapse to one entry: last data wins, first position is kept.
    pub fn replace_nodes(&self, nodes: Vec<Node>) -> bool {
        let mut next: Vec<Node> = Vec::with_capacity(nodes.len());
        for node in nodes {
            match next.iter_mut().find(|n| n.id == node.id) {
                Some(slot) => *slot = node,
                None => next.push(node),
            }
        }

        self.modify(|s| {
            if *s.nodes == next {
                return false;
            }
            s.nodes = Arc::new(next);
            true
        })
    }

    /// Insert or replace a single node. Returns true when the id was new.
    pub fn upsert_node(&self, node: Node) -> bool {
        let mut inserted = false;
        self.modify(|s| {
            let mut next = (*s.nodes).clone();
            match next.iter_mut().find(|n| n.id == node.id) {
                Some(slot) if *slot == node => return false,
                Some(slot) => *slot = node,
                None => {
                    next.push(node);
                    inserted = true;
                }
            }
            s.nodes = Arc::new(next);
            true
        });
        inserted
    }

    pub fn remove_node(&self, node_id: &str) -> bool {
        self.modify(|s| {
            if !s.nodes.iter().any(|n| n.id == node_id) {
                return false;
            }
            let next: Vec<Node> = s.nodes.iter().filter(|n| n.id != node_id).cloned().collect();
            s.nodes = Arc::new(next);
            true
        })
    }

    /// Swap the metrics of a known node. Returns false for unknown ids.
    pub fn upsert_node_metrics(&self, node_id: &str, metrics: NodeMetrics) -> bool {
        let mut found = false;
        self.modify(|s| {
            found = s.nodes.iter().any(|n| n.id == node_id);
            if !found {
                return false;
            }
            let next: Vec<Node> = s
                .nodes
                .iter()
                .map(|n| {
                    if n.id == node_id {
                        Node {
                            metrics: Some(metrics.clone()),
                            ..n.clone()
                        }
                    } else {
                        n.clone()
                    }
                })
                .collect();
            s.nodes = Arc::new(next);
            true
        });
        found
    }

    /// Swap the status of a known node. Returns false for unknown ids.
    pub fn upsert_node_status(&self, node_id: &str, status: NodeStatus) -> bool {
        let mut found = false;
        self.modify(|s| {
            let Some(current) = s.nodes.iter().find(|n| n.id == node_id) else {
                return false;
            };
            found = true;
            if current.status == status {
                return false;
            }
            let next: Vec<Node> = s
                .nodes
                .iter()
                .map(|n| {
                    if n.id == node_id {
                        Node { status, ..n.clone() }
                    } else {
                        n.clone()
                    }
                })
                .collect();
            s.nodes = Arc::new(next);
            true
        });
        found
    }

    // ------------------------------------------------------------------
    // Migrations
    // ------------------------------------------------------------------

    /// Record a newly created migration. Only PENDING records are accepted; a
    /// repeated PENDING event for a live id replaces it instead of duplicating.
    pub fn add_migration(&self, migration: Migration) -> MergeOutcome {
        if migration.status != MigrationStatus::Pending {
            return MergeOutcome::NotPending;
        }
        let mut outcome = MergeOutcome::Inserted;
        self.modify(|s| {
            let (result, changed) = merge_migration(s, migration);
            outcome = result;
            changed
        });
        outcome
    }

    /// Apply a lifecycle update. Unknown ids are inserted (late create) so
    /// feed reordering is tolerated; terminal records never change again.
    pub fn update_migration(&self, migration: Migration) -> MergeOutcome {
        let mut outcome = MergeOutcome::Inserted;
        self.modify(|s| {
            let (result, changed) = merge_migration(s, migration);
            outcome = result;
            changed
        });
        outcome
    }

    /// Record a Command API result for a migration the store has not seen.
    /// A known id is left alone: the feed is already ahead of the response.
    pub fn insert_migration_if_absent(&self, mut migration: Migration) -> bool {
        migration.progress = migration.progress.min(100);
        self.modify(|s| {
            if s.migrations.iter().any(|m| m.id == migration.id) {
                return false;
            }
            let mut next = (*s.migrations).clone();
            next.push(migration);
            s.migrations = Arc::new(next);
            true
        })
    }

    /// Merge a full listing from the Command API under the same rules as
    /// `update_migration`. Returns how many records were applied.
    pub fn merge_migrations(&self, migrations: Vec<Migration>) -> usize {
        let mut applied = 0;
        self.modify(|s| {
            let mut changed = false;
            for migration in migrations {
                let (result, did_change) = merge_migration(s, migration);
                if result.applied() {
                    applied += 1;
                }
                changed |= did_change;
            }
            changed
        });
        applied
    }

    /// Record a progress tick for a live migration; values are clamped to 100.
    pub fn update_migration_progress(&self, migration_id: &str, progress: u8) -> bool {
        let progress = progress.min(100);
        self.modify(|s| {
            let Some(current) = s.migrations.iter().find(|m| m.id == migration_id) else {
                return false;
            };
            if current.is_terminal() || current.progress == progress {
                return false;
            }
            let next: Vec<Migration> = s
                .migrations
                .iter()
                .map(|m| {
                    if m.id == migration_id {
                        Migration { progress, ..m.clone() }
                    } else {
                        m.clone()
                    }
                })
                .collect();
            s.migrations = Arc::new(next);
            true
        })
    }

    // ------------------------------------------------------------------
    // Code packages
    // ------------------------------------------------------------------

    pub fn add_code_package(&self, package: CodePackage) -> bool {
        self.modify(|s| replace_or_push_package(s, package))
    }

    pub fn merge_code_packages(&self, packages: Vec<CodePackage>) -> bool {
        self.modify(|s| {
            let mut changed = false;
            for package in packages {
                changed |= replace_or_push_package(s, package);
            }
            changed
        })
    }

    // ------------------------------------------------------------------
    // Logs and broadcasts
    // ------------------------------------------------------------------

    pub fn append_log(&self, message: impl Into<String>, level: LogLevel, tags: LogTags) {
        let entry = LogEntry {
            timestamp: Timestamp::now(),
            message: message.into(),
            level,
            tags,
        };
        let capacity = self.log_capacity;
        self.modify(|s| {
            let mut next = (*s.logs).clone();
            next.push_back(entry);
            while next.len() > capacity {
                next.pop_front();
            }
            s.logs = Arc::new(next);
            true
        });
    }

    pub fn clear_logs(&self) {
        self.modify(|s| {
            let changed = !s.logs.is_empty();
            s.logs = Arc::new(VecDeque::new());
            changed
        });
    }

    pub fn set_demo_status(&self, event: DemoEvent) {
        self.modify(|s| {
            s.demo_status = Some(Arc::new(event));
            true
        });
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared merge rule for every path that writes a migration record. Returns
/// the outcome and whether the snapshot changed.
fn merge_migration(s: &mut StoreSnapshot, mut migration: Migration) -> (MergeOutcome, bool) {
    migration.progress = migration.progress.min(100);

    let outcome = match s.migrations.iter().find(|m| m.id == migration.id) {
        Some(existing) if existing.is_terminal() => {
            debug!(
                "Dropping update for terminal migration {} ({:?})",
                migration.id, existing.status
            );
            return (MergeOutcome::Frozen, false);
        }
        Some(existing) if lifecycle_rank(migration.status) < lifecycle_rank(existing.status) => {
            debug!(
                "Dropping {:?} record for migration {} already {:?}",
                migration.status, migration.id, existing.status
            );
            return (MergeOutcome::Stale, false);
        }
        Some(existing) if *existing == migration => return (MergeOutcome::Replaced, false),
        Some(_) => MergeOutcome::Replaced,
        None => MergeOutcome::Inserted,
    };

    if migration.status == MigrationStatus::Completed {
        relocate_code_package(s, &migration.code_id, &migration.target_node_id);
    }

    let mut next = (*s.migrations).clone();
    match outcome {
        MergeOutcome::Replaced => {
            if let Some(slot) = next.iter_mut().find(|m| m.id == migration.id) {
                *slot = migration;
            }
        }
        _ => next.push(migration),
    }
    s.migrations = Arc::new(next);
    (outcome, true)
}

fn relocate_code_package(s: &mut StoreSnapshot, code_id: &str, node_id: &str) {
    let needs_move = s
        .code_packages
        .iter()
        .any(|c| c.id == code_id && c.current_node_id.as_deref() != Some(node_id));
    if !needs_move {
        return;
    }
    let next: Vec<CodePackage> = s
        .code_packages
        .iter()
        .map(|c| {
            if c.id == code_id {
                CodePackage {
                    current_node_id: Some(node_id.to_string()),
                    ..c.clone()
                }
            } else {
                c.clone()
            }
        })
        .collect();
    s.code_packages = Arc::new(next);
}

fn replace_or_push_package(s: &mut StoreSnapshot, package: CodePackage) -> bool {
    let mut next = (*s.code_packages).clone();
    match next.iter_mut().find(|c| c.id == package.id) {
        Some(slot) if *slot == package => return false,
        Some(slot) => *slot = package,
        None => next.push(package),
    }
    s.code_packages = Arc::new(next);
    true
}
