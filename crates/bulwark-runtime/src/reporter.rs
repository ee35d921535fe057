//! Periodic health reporting for a chain.

use bulwark_core::{CircuitState, NodeHealth};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::chain::AsyncChain;

/// Call `on_report` with the chain's health every `period`.
///
/// The first report is taken immediately. The task runs until aborted.
pub fn spawn_health_watch<T, F>(chain: AsyncChain<T>, period: Duration, mut on_report: F) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: FnMut(Vec<NodeHealth>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            on_report(chain.health());
        }
    })
}

/// Log the chain's health every `period`: degraded dependencies at warn,
/// healthy ones at debug.
pub fn spawn_health_reporter<T>(chain: AsyncChain<T>, period: Duration) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
{
    spawn_health_watch(chain, period, |report| {
        for node in report {
            match node.state {
                CircuitState::Closed => tracing::debug!(
                    dependency = %node.name,
                    failures = node.failure_count,
                    "Dependency healthy"
                ),
                state => tracing::warn!(
                    dependency = %node.name,
                    state = %state,
                    failures = node.failure_count,
                    "Dependency degraded"
                ),
            }
        }
    })
}
