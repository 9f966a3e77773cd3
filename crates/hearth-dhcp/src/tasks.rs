use crate::metrics::MessageCounters;
use chrono::Utc;
use hearth_msg::MetricsSink;
use hearth_store::LeaseStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Periodic expiry sweep plus history pruning. `history_cleanup_days == 0`
/// keeps the full history.
pub async fn run_expiry_sweeper(
    store: LeaseStore,
    period: Duration,
    history_cleanup_days: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match store.mark_expired_leases() {
                    Ok(0) => debug!("expiry sweep: nothing to do"),
                    Ok(n) => info!(count = n, "expiry sweep marked leases"),
                    Err(e) => error!("expiry sweep failed: {e}"),
                }

                if history_cleanup_days > 0 {
                    let cutoff = Utc::now() - chrono::Duration::days(history_cleanup_days as i64);
                    match store.history().prune(cutoff) {
                        Ok(0) => {}
                        Ok(n) => info!(count = n, days = history_cleanup_days, "history pruned"),
                        Err(e) => error!("history pruning failed: {e}"),
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("expiry sweeper shutting down");
                    break;
                }
            }
        }
    }
}

/// Push the message counters to the metrics sink on a fixed interval,
/// resetting them after every snapshot.
pub async fn run_metrics_flusher(
    counters: MessageCounters,
    sink: Arc<dyn MetricsSink>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let snapshot = counters.snapshot_and_reset();
                if !snapshot.is_empty() {
                    sink.write_counters(&snapshot);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("metrics flusher shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DhcpMessageType;
    use hearth_msg::noop::NoopNotifier;
    use hearth_store::{HistoryLog, LeaseStore, StoreOptions};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingSink {
        snapshots: Mutex<Vec<HashMap<String, u64>>>,
    }

    impl MetricsSink for RecordingSink {
        fn write_counters(&self, counters: &HashMap<String, u64>) {
            self.snapshots.lock().unwrap().push(counters.clone());
        }
    }

    fn test_store(lease_time_secs: u64) -> (LeaseStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let history = HistoryLog::open(&dir.path().join("history.redb")).unwrap();
        let store = LeaseStore::open(
            &dir.path().join("leases.redb"),
            history,
            Arc::new(NoopNotifier),
            StoreOptions {
                lease_time_secs,
                inactive_period: chrono::Duration::days(7),
            },
        )
        .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_sweeper_marks_and_stops() {
        let (store, _dir) = test_store(0);
        store
            .create_lease(
                "aa:bb:cc:dd:ee:01",
                "10.0.0.100".parse().unwrap(),
                None,
                hearth_core::types::LeaseType::Dynamic,
                None,
                hearth_core::types::CreateChannel::DhcpRequest,
                hearth_core::types::ChangeChannel::Dhcp,
            )
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_expiry_sweeper(
            store.clone(),
            Duration::from_millis(20),
            0,
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper exits promptly after shutdown")
            .unwrap();

        let lease = store.get_lease("aa:bb:cc:dd:ee:01").unwrap().unwrap();
        assert!(lease.is_expired);
    }

    #[tokio::test]
    async fn test_flusher_snapshots_and_stops() {
        let counters = MessageCounters::new();
        counters.record(DhcpMessageType::Discover);
        counters.record(DhcpMessageType::Offer);

        let sink = Arc::new(RecordingSink {
            snapshots: Mutex::new(Vec::new()),
        });

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_metrics_flusher(
            counters.clone(),
            sink.clone(),
            1,
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("flusher exits promptly after shutdown")
            .unwrap();

        let snapshots = sink.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].get("DISCOVER"), Some(&1));
        // Counters were reset by the snapshot
        assert!(counters.snapshot_and_reset().is_empty());
    }
}
