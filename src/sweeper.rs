use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{today, Engine};

/// Periodically move confirmed bookings whose stay has ended to `completed`.
pub async fn run_completion_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let completed = sweep_once(&engine).await;
        if completed > 0 {
            info!(completed, "completion sweep");
        }
        engine.notify.prune();
    }
}

/// One pass of the completion sweep. Returns how many bookings moved.
pub async fn sweep_once(engine: &Engine) -> usize {
    let mut completed = 0;
    for id in engine.collect_finished_stays(today()).await {
        match engine.complete_booking(id).await {
            Ok(_) => completed += 1,
            // Cancelled or deleted since it was collected.
            Err(e) => debug!("sweeper skip {id}: {e}"),
        }
    }
    completed
}

/// Compact the WAL whenever enough records piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await >= threshold
            && let Err(e) = engine.compact_wal().await
        {
            warn!("WAL compaction failed: {e}");
        }
    }
}
