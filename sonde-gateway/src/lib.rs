pub mod api;
pub mod config;
pub mod socket;
pub mod state;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use socket::SocketSettings;
use state::GatewayState;

/// Shared handler state for the REST surface and the socket endpoint.
#[derive(Clone)]
pub struct AppState<Q, S> {
    pub queue: Q,
    pub series: S,
    pub gateway: GatewayState,
    pub settings: SocketSettings,
    pub cancel: CancellationToken,
    /// Tracks connection tasks, which outlive the upgrade request; shutdown
    /// waits on it for their disconnect flushes.
    pub tracker: TaskTracker,
}
