//! Real-time state synchronization and batch orchestration for the
//! migration platform's operator console.
//!
//! The [`feed`] client keeps one reconnecting push connection open and turns
//! wire messages into [`feed::FeedEvent`]s. A single apply loop owned by
//! [`Console`] folds those into the [`store::EntityStore`], which readers
//! observe through snapshots and a change channel. Operator actions go
//! through the [`command_client::CommandClient`]; multi-item runs go through
//! the [`batch::BatchOrchestrator`].

pub mod batch;
pub mod command_client;
pub mod config;
pub mod error;
pub mod feed;
pub mod logging;
pub mod store;
pub mod sync;
pub mod types;

pub use batch::{BatchItem, BatchItemStatus, BatchOrchestrator, BatchPlan, BatchReport};
pub use command_client::{CommandClient, MigrationLauncher};
pub use config::{default_config_path, BatchConfig, ConsoleConfig, FeedConfig};
pub use error::{BatchError, CommandError, DecodeError, FeedError};
pub use store::{EntityStore, MergeOutcome, StoreSnapshot};
pub use sync::{apply_event, Console};
