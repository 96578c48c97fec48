//! Host reconciliation, outbound event streams and host operations.

pub mod backoff;
pub mod dispatch;
mod error;
pub mod handlers;
mod operations;
mod reconcile;
mod ws_client;
mod ws_manager;

pub use backoff::{Backoff, sleep_or_cancel};
pub use dispatch::{EventDispatcher, HostEventHandler};
pub use error::{OrchestratorError, OrchestratorResult};
pub use handlers::{HostHealthHandler, HostLogsHandler, HostStatsHandler, HostVmEventHandler};
pub use operations::HostOperations;
pub use reconcile::{ReconciliationLoop, merge_snapshot};
pub use ws_client::{ClientSettings, HostWebSocketClient, SUBSCRIBE_PATH, subscribe_url};
pub use ws_manager::{HostWebSocketManager, RefreshSummary};
