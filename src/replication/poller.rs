use crate::index::instance::IndexInstance;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Runs `replication_check` on `instance` every `interval` until the
/// instance is dropped. Cycles run on the blocking pool since they do file
/// I/O and take the instance locks.
pub fn spawn_poller(
    handle: &tokio::runtime::Handle,
    instance: Weak<IndexInstance>,
    interval: Duration,
) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(strong) = instance.upgrade() else {
                break;
            };
            let name = strong.name().to_string();
            match tokio::task::spawn_blocking(move || strong.replication_check()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("[REPL {}] scheduled cycle failed: {}", name, e),
                Err(e) => {
                    tracing::warn!("[REPL {}] scheduled cycle panicked: {}", name, e);
                }
            }
        }
        tracing::debug!("[REPL] poller stopped");
    })
}
