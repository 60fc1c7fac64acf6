pub mod network;
pub mod peer;
pub mod remote;

pub use network::TestNetwork;
pub use peer::{test_config, TestPeer};
pub use remote::{Call, MemoryRemote};

use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long scenario tests wait for an asynchronous effect.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Route engine logs to the test writer. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "blocksync_engine=debug,blocksync_storage=debug,warn".into()))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

/// Wait until the watched value satisfies `pred`, or give up after
/// [`SETTLE_TIMEOUT`].
pub async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, pred: impl FnMut(&T) -> bool) -> Option<T> {
    match tokio::time::timeout(SETTLE_TIMEOUT, rx.wait_for(pred)).await {
        Ok(Ok(value)) => Some(value.clone()),
        _ => None,
    }
}
