use crate::plot::{DownloadState, RemoteState};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Point-in-time view of one plot, cheap to clone and free of locks. The
/// processor publishes one per plot each tick; renderers never touch the
/// entities themselves.
#[derive(Debug, Clone)]
pub struct PlotSnapshot {
    pub id: String,
    pub remote_state: RemoteState,
    pub plotting_progress: u8,
    pub download_state: DownloadState,
    pub download_directory: Option<PathBuf>,
    pub downloaded_bytes: u64,
    pub download_size: u64,
    pub download_speed: Option<u64>,
    pub download_progress: f64,
    pub download_error: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub plots: Vec<PlotSnapshot>,
}

impl OrderSnapshot {
    fn count(&self, state: RemoteState) -> usize {
        self.plots
            .iter()
            .filter(|plot| plot.remote_state == state)
            .count()
    }
}

/// Creates the snapshot channel the processor publishes into. An external
/// renderer holds the receiver.
pub fn channel() -> (watch::Sender<OrderSnapshot>, watch::Receiver<OrderSnapshot>) {
    watch::channel(OrderSnapshot::default())
}

/// Formats a speed sample for humans; a missing sample (no history yet, or a
/// rewind after truncation) renders as "-".
pub fn format_speed(speed: Option<u64>) -> String {
    match speed {
        Some(bytes_per_second) => format!("{}/s", format_bytes(bytes_per_second)),
        None => "-".to_string(),
    }
}

/// Decimal byte formatting (kB = 1000 B), one digit of precision.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Minimal built-in snapshot consumer: logs a one-line order summary and one
/// line per active download whenever the snapshot changes. The full-screen
/// table renderer subscribes to the same channel and replaces this.
pub async fn log_summaries(mut rx: watch::Receiver<OrderSnapshot>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let snapshot = rx.borrow_and_update().clone();
        if snapshot.plots.is_empty() {
            continue;
        }

        let downloading = snapshot
            .plots
            .iter()
            .filter(|plot| {
                matches!(
                    plot.download_state,
                    DownloadState::Downloading | DownloadState::LiveValidation
                )
            })
            .count();
        tracing::info!(
            order = %snapshot.order_id,
            plots = snapshot.plots.len(),
            pending = snapshot.count(RemoteState::Pending),
            plotting = snapshot.count(RemoteState::Plotting),
            downloading,
            expired = snapshot.count(RemoteState::Expired),
            cancelled = snapshot.count(RemoteState::Cancelled),
            "order status"
        );

        for plot in &snapshot.plots {
            match plot.download_state {
                DownloadState::Downloading | DownloadState::LiveValidation => {
                    tracing::info!(
                        plot = %plot.id,
                        progress = format!("{:.2}%", plot.download_progress),
                        speed = %format_speed(plot.download_speed),
                        "downloading"
                    );
                }
                _ if plot.download_error => {
                    tracing::warn!(
                        plot = %plot.id,
                        state = %plot.download_state,
                        "plot needs attention"
                    );
                }
                _ => {}
            }
        }

        // avoid hammering the log when snapshots change every tick
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_format_in_decimal_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(999), "999 B");
        assert_eq!(format_bytes(1_000), "1.0 kB");
        assert_eq!(format_bytes(25_000_000_000), "25.0 GB");
        assert_eq!(format_bytes(1_500_000), "1.5 MB");
    }

    #[test]
    fn missing_speed_renders_as_dash() {
        assert_eq!(format_speed(None), "-");
        assert_eq!(format_speed(Some(2_000_000)), "2.0 MB/s");
    }
}
