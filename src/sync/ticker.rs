//! Background periodic sync.
//!
//! A task that loops on an interval and a cancellation token: each tick
//! attempts one engine run, skipping cleanly when a run is already in
//! flight or inside the cooldown window. On cancellation the loop lets any
//! in-flight run unwind before returning. Reports via logs only.

use crate::error::Error;
use crate::sync::SyncEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run the background sync loop until `cancel` fires.
pub async fn run_loop(engine: Arc<SyncEngine>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; consume it so the loop waits
    // a full interval before its first run.
    ticker.tick().await;

    tracing::info!(interval_secs = interval.as_secs(), "background sync loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match engine.run().await {
                    Ok(result) if result.success() => {
                        tracing::info!(
                            uploaded = result.uploaded,
                            downloaded = result.downloaded,
                            "background sync ok"
                        );
                    }
                    Ok(result) => {
                        tracing::warn!(
                            errors = result.errors.len(),
                            "background sync finished with errors: {:?}",
                            result.errors
                        );
                    }
                    Err(Error::InProgress) | Err(Error::Cooldown(_)) => {
                        tracing::debug!("background sync tick skipped");
                    }
                    Err(e) => {
                        tracing::warn!("background sync failed: {e}");
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
        }
    }

    tracing::info!("background sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::store::LocalStore;
    use crate::sync::engine::EnginePaths;
    use crate::transport::ApiClient;
    use crate::vault::{Vault, DEFAULT_SESSION_TTL};
    use tempfile::TempDir;

    fn disabled_engine(tmp: &TempDir) -> Arc<SyncEngine> {
        let store = Arc::new(LocalStore::open(&tmp.path().join("records.db")).unwrap());
        let vault = Arc::new(Vault::open(tmp.path(), DEFAULT_SESSION_TTL));
        let transport = Arc::new(ApiClient::with_base_url("http://127.0.0.1:9"));
        let config = SyncConfig {
            enabled: false,
            ..SyncConfig::default()
        };
        let paths = EnginePaths {
            metadata: tmp.path().join("sync_metadata.json"),
            stats: tmp.path().join("sync_stats.json"),
            state: tmp.path().join("state.json"),
        };
        Arc::new(SyncEngine::new(store, transport, vault, config, paths))
    }

    #[tokio::test]
    async fn cancelled_loop_returns() {
        let tmp = TempDir::new().unwrap();
        let engine = disabled_engine(&tmp);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_loop(
            engine,
            Duration::from_millis(20),
            cancel.clone(),
        ));

        // Let a couple of ticks fire (each aborts fast on the disabled
        // precondition), then cancel.
        tokio::time::sleep(Duration::from_millis(70)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn pre_cancelled_loop_exits_without_ticking() {
        let tmp = TempDir::new().unwrap();
        let engine = disabled_engine(&tmp);
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(1),
            run_loop(engine, Duration::from_secs(3600), cancel),
        )
        .await
        .expect("loop ignored pre-cancelled token");
    }
}
