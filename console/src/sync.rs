//! Console lifecycle: wires the feed into the store through a single apply
//! loop and applies Command API results on the operator's behalf.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchOrchestrator, BatchPlan, BatchReport};
use crate::command_client::CommandClient;
use crate::config::ConsoleConfig;
use crate::error::{BatchError, CommandError};
use crate::feed::{FeedClient, FeedConnector, FeedEvent, FeedHandle, MqttConnector};
use crate::store::{EntityStore, MergeOutcome};
use crate::types::{
    CodePackage, LogLevel, LogTags, Migration, MigrationRequest, MigrationStatus, NodeMetrics,
    Topology, UploadCodeRequest,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Console {
    store: Arc<EntityStore>,
    commands: Arc<CommandClient>,
    batch: Arc<BatchOrchestrator<CommandClient>>,
    feed: Option<FeedHandle>,
    apply_task: Option<JoinHandle<()>>,
}

impl Console {
    /// Start against the MQTT broker named in `config.feed`.
    pub fn start(config: &ConsoleConfig) -> Result<Self> {
        Self::start_with(config, MqttConnector::new(&config.feed))
    }

    pub fn start_with<C: FeedConnector>(config: &ConsoleConfig, connector: C) -> Result<Self> {
        let commands = Arc::new(CommandClient::new(
            &config.api_base_url,
            config.request_timeout(),
        )?);
        let batch = Arc::new(BatchOrchestrator::new(
            commands.clone(),
            config.batch.pacing(),
        ));
        let store = Arc::new(EntityStore::with_log_capacity(config.log_capacity));

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let apply_task = tokio::spawn(apply_loop(store.clone(), events_rx));
        let feed = FeedClient::new(connector, config.feed.clone(), events_tx).connect();

        info!("Console started (api={})", commands.base_url());
        Ok(Self {
            store,
            commands,
            batch,
            feed: Some(feed),
            apply_task: Some(apply_task),
        })
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn commands(&self) -> &CommandClient {
        &self.commands
    }

    pub fn batch(&self) -> &Arc<BatchOrchestrator<CommandClient>> {
        &self.batch
    }

    /// Live feed connection; `None` after shutdown.
    pub fn feed(&self) -> Option<&FeedHandle> {
        self.feed.as_ref()
    }

    /// Disconnect the feed and drain events already received. Applied state
    /// stays in the store.
    pub async fn shutdown(mut self) {
        self.batch.cancel();
        if let Some(feed) = self.feed.take() {
            feed.disconnect().await;
        }
        if let Some(task) = self.apply_task.take() {
            if let Err(e) = task.await {
                error!("Console apply loop failed: {}", e);
            }
        }
        info!("Console stopped");
    }

    // ============================================================================
    // Command API helpers
    // ============================================================================

    pub async fn refresh_topology(&self) -> Result<Topology, CommandError> {
        match self.commands.topology().await {
            Ok(topology) => {
                self.store.replace_nodes(topology.nodes.clone());
                Ok(topology)
            }
            Err(e) => Err(self.report("Failed to fetch topology", e)),
        }
    }

    pub async fn refresh_migrations(&self) -> Result<Vec<Migration>, CommandError> {
        match self.commands.list_migrations().await {
            Ok(migrations) => {
                let applied = self.store.merge_migrations(migrations.clone());
                debug!("Merged {}/{} migrations", applied, migrations.len());
                Ok(migrations)
            }
            Err(e) => Err(self.report("Failed to fetch migrations", e)),
        }
    }

    pub async fn refresh_code_packages(&self) -> Result<Vec<CodePackage>, CommandError> {
        match self.commands.list_code().await {
            Ok(packages) => {
                self.store.merge_code_packages(packages.clone());
                Ok(packages)
            }
            Err(e) => Err(self.report("Failed to fetch code packages", e)),
        }
    }

    pub async fn refresh_node_metrics(&self, node_id: &str) -> Result<NodeMetrics, CommandError> {
        match self.commands.node_metrics(node_id).await {
            Ok(metrics) => {
                if !self.store.upsert_node_metrics(node_id, metrics.clone()) {
                    debug!("Metrics for unknown node {} not stored", node_id);
                }
                Ok(metrics)
            }
            Err(e) => Err(self.report(&format!("Failed to fetch metrics for {}", node_id), e)),
        }
    }

    pub async fn upload_code(&self, request: &UploadCodeRequest) -> Result<CodePackage, CommandError> {
        match self.commands.upload_code(request).await {
            Ok(package) => {
                self.store.append_log(
                    format!("Code uploaded: {} - {}", package.id, package.name),
                    LogLevel::Success,
                    LogTags::default(),
                );
                self.store.add_code_package(package.clone());
                Ok(package)
            }
            Err(e) => Err(self.report("Upload error", e)),
        }
    }

    pub async fn create_migration(
        &self,
        request: &MigrationRequest,
    ) -> Result<Migration, CommandError> {
        if request.source_node_id.is_empty() || request.target_node_id.is_empty() {
            let err = CommandError::InvalidRequest(
                "Please select source and target nodes".to_string(),
            );
            return Err(self.report("Error", err));
        }
        if request.source_node_id == request.target_node_id {
            let err = CommandError::InvalidRequest(
                "Source and target nodes must differ".to_string(),
            );
            return Err(self.report("Error", err));
        }

        match self.commands.create_migration(request).await {
            Ok(migration) => {
                self.store.append_log(
                    format!("Migration initiated: {}", migration.id),
                    LogLevel::Success,
                    LogTags::default(),
                );
                if !self.store.insert_migration_if_absent(migration.clone()) {
                    debug!("Migration {} already known from the feed", migration.id);
                }
                Ok(migration)
            }
            Err(e) => Err(self.report("Error", e)),
        }
    }

    pub async fn cancel_migration(&self, migration_id: &str) -> Result<Migration, CommandError> {
        match self.commands.cancel_migration(migration_id).await {
            Ok(migration) => {
                if self.store.update_migration(migration.clone()).applied() {
                    self.store.append_log(
                        format!("Migration cancelled: {}", migration.id),
                        LogLevel::Warning,
                        LogTags::default(),
                    );
                }
                Ok(migration)
            }
            Err(e) => Err(self.report(&format!("Failed to cancel {}", migration_id), e)),
        }
    }

    /// Run a batch and record its tally in the log ring.
    pub async fn run_batch(&self, plan: BatchPlan) -> Result<BatchReport, BatchError> {
        match self.batch.run(plan).await {
            Ok(report) => {
                let level = if report.failed == 0 && report.cancelled == 0 {
                    LogLevel::Success
                } else {
                    LogLevel::Warning
                };
                self.store.append_log(
                    format!("Batch migration complete: {}", report),
                    level,
                    LogTags::default(),
                );
                Ok(report)
            }
            Err(e) => {
                warn!("Batch rejected: {}", e);
                self.store
                    .append_log(format!("Batch rejected: {}", e), LogLevel::Error, LogTags::default());
                Err(e)
            }
        }
    }

    fn report(&self, context: &str, err: CommandError) -> CommandError {
        warn!("{}: {}", context, err);
        self.store.append_log(
            format!("{}: {}", context, err.user_message()),
            LogLevel::Error,
            LogTags::default(),
        );
        err
    }
}

async fn apply_loop(store: Arc<EntityStore>, mut events: mpsc::Receiver<FeedEvent>) {
    while let Some(event) = events.recv().await {
        apply_event(&store, event);
    }
    debug!("Feed event channel closed, apply loop done");
}

/// Apply one feed event to the store, emitting the operator-facing log line
/// that goes with it.
pub fn apply_event(store: &EntityStore, event: FeedEvent) {
    match event {
        FeedEvent::Connected => {
            store.set_connected(true);
            store.append_log("Connected to server", LogLevel::Success, LogTags::default());
        }
        FeedEvent::Disconnected { reason } => {
            debug!("Feed disconnected: {}", reason);
            store.set_connected(false);
            store.append_log("Disconnected from server", LogLevel::Warning, LogTags::default());
        }
        FeedEvent::ProtocolError(message) => {
            store.append_log(
                format!("Connection error: {}", message),
                LogLevel::Error,
                LogTags::default(),
            );
        }
        FeedEvent::Malformed { topic, reason } => {
            debug!("Malformed message on {}: {}", topic, reason);
            store.append_log(
                format!("Dropped malformed message on {}", topic),
                LogLevel::Warning,
                LogTags::default(),
            );
        }
        FeedEvent::Topology(nodes) => {
            store.replace_nodes(nodes);
        }
        FeedEvent::NodeMetrics { node_id, metrics } => {
            if !store.upsert_node_metrics(&node_id, metrics) {
                debug!("Metrics for unknown node {} ignored", node_id);
            }
        }
        FeedEvent::MigrationCreated(migration) => {
            let message = format!(
                "Migration started: {} -> {}",
                migration.source_node_id, migration.target_node_id
            );
            let tags = LogTags {
                node_id: Some(migration.source_node_id.clone()),
                event: None,
            };
            if store.add_migration(migration).applied() {
                store.append_log(message, LogLevel::Info, tags);
            }
        }
        FeedEvent::MigrationUpdated(migration) => apply_migration_update(store, migration),
        FeedEvent::MigrationProgress {
            migration_id,
            progress,
            message,
        } => {
            if !store.update_migration_progress(&migration_id, progress) {
                debug!("Progress for {} not applied", migration_id);
            }
            store.append_log(
                format!("[{}%] {}", progress, message),
                LogLevel::Info,
                LogTags::default(),
            );
        }
        FeedEvent::Log {
            message,
            level,
            tags,
        } => store.append_log(message, level, tags),
        FeedEvent::Demo(event) => {
            store.append_log(event.message.clone(), event.kind.log_level(), LogTags::default());
            store.set_demo_status(event);
        }
    }
}

fn apply_migration_update(store: &EntityStore, migration: Migration) {
    let id = migration.id.clone();
    let status = migration.status;
    let error_message = migration.error_message.clone();

    match store.update_migration(migration) {
        MergeOutcome::Frozen | MergeOutcome::NotPending | MergeOutcome::Stale => return,
        MergeOutcome::Inserted => {
            warn!("Update for unknown migration {} stored as new record", id)
        }
        MergeOutcome::Replaced => {}
    }

    match status {
        MigrationStatus::Completed => store.append_log(
            format!("Migration completed: {}", id),
            LogLevel::Success,
            LogTags::default(),
        ),
        MigrationStatus::Failed => store.append_log(
            format!(
                "Migration failed: {}",
                error_message.as_deref().unwrap_or("unknown error")
            ),
            LogLevel::Error,
            LogTags::default(),
        ),
        MigrationStatus::Cancelled => store.append_log(
            format!("Migration cancelled: {}", id),
            LogLevel::Warning,
            LogTags::default(),
        ),
        MigrationStatus::Pending | MigrationStatus::InProgress => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedConfig;
    use crate::feed::memory_transport;
    use crate::types::{MigrationType, Node, NodeRole, NodeStatus, Timestamp};
    use std::time::Duration;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            host: "10.0.0.1".to_string(),
            port: 8081,
            role: NodeRole::Worker,
            status: NodeStatus::Online,
            metrics: None,
            connected_at: None,
        }
    }

    fn migration(id: &str, status: MigrationStatus) -> Migration {
        Migration {
            id: id.to_string(),
            migration_type: MigrationType::Strong,
            source_node_id: "node-1".to_string(),
            target_node_id: "node-2".to_string(),
            code_id: "c1".to_string(),
            status,
            progress: 0,
            start_time: Some(Timestamp::now()),
            end_time: None,
            error_message: None,
        }
    }

    fn messages(store: &EntityStore) -> Vec<String> {
        store.snapshot().logs.iter().map(|l| l.message.clone()).collect()
    }

    fn test_config() -> ConsoleConfig {
        ConsoleConfig {
            api_base_url: "http://127.0.0.1:9/api".to_string(),
            feed: FeedConfig {
                reconnect_delay_ms: 10,
                heartbeat_incoming_ms: 0,
                connect_timeout_ms: 60_000,
                ..FeedConfig::default()
            },
            ..ConsoleConfig::default()
        }
    }

    #[test]
    fn test_migration_lifecycle_logs() {
        let store = EntityStore::new();
        apply_event(&store, FeedEvent::MigrationCreated(migration("m1", MigrationStatus::Pending)));
        apply_event(
            &store,
            FeedEvent::MigrationProgress {
                migration_id: "m1".into(),
                progress: 60,
                message: "Transferring code".into(),
            },
        );
        apply_event(&store, FeedEvent::MigrationUpdated(migration("m1", MigrationStatus::Completed)));
        // Late duplicate after the terminal state changes nothing.
        apply_event(&store, FeedEvent::MigrationUpdated(migration("m1", MigrationStatus::InProgress)));

        assert_eq!(
            messages(&store),
            vec![
                "Migration started: node-1 -> node-2",
                "[60%] Transferring code",
                "Migration completed: m1",
            ]
        );
        assert_eq!(
            store.migration_by_id("m1").unwrap().status,
            MigrationStatus::Completed
        );
    }

    #[test]
    fn test_failed_migration_logs_error_message() {
        let store = EntityStore::new();
        let mut failed = migration("m2", MigrationStatus::Failed);
        failed.error_message = Some("target unreachable".into());
        apply_event(&store, FeedEvent::MigrationUpdated(failed));

        let logs = store.snapshot().logs;
        let last = logs.back().unwrap();
        assert_eq!(last.message, "Migration failed: target unreachable");
        assert_eq!(last.level, LogLevel::Error);
    }

    #[test]
    fn test_connection_events_toggle_flag_and_keep_entities() {
        let store = EntityStore::new();
        apply_event(&store, FeedEvent::Connected);
        apply_event(&store, FeedEvent::Topology(vec![node("node-1")]));
        assert!(store.is_connected());

        apply_event(&store, FeedEvent::Disconnected { reason: "gone".into() });
        assert!(!store.is_connected());
        assert!(store.node_by_id("node-1").is_some());
        assert_eq!(
            messages(&store),
            vec!["Connected to server", "Disconnected from server"]
        );
    }

    #[test]
    fn test_demo_event_sets_status_and_logs() {
        let store = EntityStore::new();
        let demo: crate::types::DemoEvent =
            serde_json::from_str(r#"{"type":"demo:error","message":"node-3 crashed"}"#).unwrap();
        apply_event(&store, FeedEvent::Demo(demo.clone()));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.demo_status.as_deref(), Some(&demo));
        assert_eq!(snapshot.logs.back().unwrap().level, LogLevel::Error);
    }

    #[test]
    fn test_malformed_event_is_logged_as_warning() {
        let store = EntityStore::new();
        apply_event(
            &store,
            FeedEvent::Malformed {
                topic: "topic/nodes".into(),
                reason: "expected value".into(),
            },
        );
        let logs = store.snapshot().logs;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Warning);
    }

    #[tokio::test]
    async fn test_reconnect_converges() {
        let (connector, broker) = memory_transport();
        let peer = broker.accept();
        let console = Console::start_with(&test_config(), connector).unwrap();
        let mut changes = console.store().subscribe();
        let within = Duration::from_secs(5);

        peer.send_json(
            "topic/nodes",
            &serde_json::json!({ "nodes": [node("node-1"), node("node-2")] }),
        );
        peer.send_json("topic/migrations", &migration("m1", MigrationStatus::Pending));
        tokio::time::timeout(within, changes.wait_for(|s| s.connected && s.migrations.len() == 1))
            .await
            .unwrap()
            .unwrap();

        peer.drop_connection();
        tokio::time::timeout(within, changes.wait_for(|s| !s.connected))
            .await
            .unwrap()
            .unwrap();

        let peer = broker.accept();
        tokio::time::timeout(within, changes.wait_for(|s| s.connected))
            .await
            .unwrap()
            .unwrap();
        peer.send_json("topic/migrations", &migration("m1", MigrationStatus::InProgress));
        peer.send_json("topic/migrations", &migration("m2", MigrationStatus::Pending));
        tokio::time::timeout(within, changes.wait_for(|s| s.migrations.len() == 2))
            .await
            .unwrap()
            .unwrap();

        let snapshot = console.store().snapshot();
        let ids: Vec<&str> = snapshot.migrations.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(snapshot.migrations[0].status, MigrationStatus::InProgress);
        assert_eq!(snapshot.nodes.len(), 2);

        console.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_keeps_applied_state() {
        let (connector, broker) = memory_transport();
        let peer = broker.accept();
        let console = Console::start_with(&test_config(), connector).unwrap();
        let store = console.store().clone();
        let mut changes = store.subscribe();

        peer.send_json("topic/nodes", &serde_json::json!({ "nodes": [node("node-1")] }));
        tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|s| s.nodes.len() == 1))
            .await
            .unwrap()
            .unwrap();

        console.shutdown().await;
        assert!(!store.is_connected());
        assert!(store.node_by_id("node-1").is_some());

        // Nothing reaches the store after shutdown.
        let version = store.snapshot().version;
        peer.send_json("topic/nodes", &serde_json::json!({ "nodes": [] }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.snapshot().version, version);
    }

    #[tokio::test]
    async fn test_invalid_single_migration_is_rejected_locally() {
        let (connector, _broker) = memory_transport();
        let console = Console::start_with(&test_config(), connector).unwrap();

        let request = MigrationRequest {
            code_id: "c1".into(),
            source_node_id: "node-1".into(),
            target_node_id: "node-1".into(),
            migration_type: MigrationType::Weak,
        };
        let err = console.create_migration(&request).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidRequest(_)));
        assert_eq!(
            messages(console.store()).last().map(String::as_str),
            Some("Error: Source and target nodes must differ")
        );
        console.shutdown().await;
    }
}
