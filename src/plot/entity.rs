use crate::plot::state::{DownloadState, RemoteState};
use crate::status::PlotSnapshot;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Size of the hash-verified segments a plot file is divided into.
pub const CHUNK_SIZE: u64 = 10_000_000_000;

/// How many `(bytes, time)` samples the speed estimate looks back over.
const DOWNLOAD_HISTORY_LEN: usize = 5;

/// Poisoning here means a plot task panicked mid-update. Every guarded field
/// is a plain value, so the recovered state is still usable; one plot's bug
/// must not take the processor down with it.
fn recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("plot lock poisoned; continuing with recovered state");
            poisoned.into_inner()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HistoryRecord {
    bytes: u64,
    at: Instant,
}

/// One plot of the order: remote lifecycle mirror plus everything the local
/// download needs. The processor owns the plot; its prepare/download tasks
/// receive clones of the `Arc` and write only through the methods here, so
/// each field keeps a single logical writer. The tick loop reads whatever is
/// current; a stale read only affects the status display.
pub struct Plot {
    pub id: String,
    chunk_size: u64,
    state: Mutex<RemoteState>,
    plotting_progress: AtomicU8,
    download_url: Mutex<String>,
    download_state: Mutex<DownloadState>,
    chunk_hashes: Mutex<Vec<String>>,
    download_size: AtomicU64,
    download_filename: Mutex<String>,
    download_directory: Mutex<Option<PathBuf>>,
    downloaded_bytes: AtomicU64,
    download_history: Mutex<VecDeque<HistoryRecord>>,
    download_error: AtomicBool,
    truncate_from: Mutex<Option<u64>>,
    cancel: Mutex<Option<CancellationToken>>,
    /// The open read/write handle to the partial file. Holding this lock for
    /// the whole of a download is what guarantees a plot is never downloaded
    /// by two tasks at once.
    pub(crate) file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl Plot {
    pub fn new(
        id: impl Into<String>,
        state: RemoteState,
        url: impl Into<String>,
        plotting_progress: u8,
    ) -> Self {
        Self::with_chunk_size(id, state, url, plotting_progress, CHUNK_SIZE)
    }

    /// Same as [`Plot::new`] with an explicit chunk geometry. The production
    /// constant is [`CHUNK_SIZE`]; smaller values let multi-chunk behaviour
    /// be exercised on small files.
    pub fn with_chunk_size(
        id: impl Into<String>,
        state: RemoteState,
        url: impl Into<String>,
        plotting_progress: u8,
        chunk_size: u64,
    ) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            id: id.into(),
            chunk_size,
            state: Mutex::new(state),
            plotting_progress: AtomicU8::new(plotting_progress),
            download_url: Mutex::new(url.into()),
            download_state: Mutex::new(DownloadState::Empty),
            chunk_hashes: Mutex::new(Vec::new()),
            download_size: AtomicU64::new(0),
            download_filename: Mutex::new(String::new()),
            download_directory: Mutex::new(None),
            downloaded_bytes: AtomicU64::new(0),
            download_history: Mutex::new(VecDeque::with_capacity(DOWNLOAD_HISTORY_LEN)),
            download_error: AtomicBool::new(false),
            truncate_from: Mutex::new(None),
            cancel: Mutex::new(None),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn remote_state(&self) -> RemoteState {
        *recover(&self.state)
    }

    pub fn update_state(&self, next: RemoteState) {
        let changed = {
            let mut state = recover(&self.state);
            let prev = *state;
            if prev == next {
                None
            } else {
                *state = next;
                Some(prev)
            }
        };
        if let Some(prev) = changed {
            tracing::info!(plot = %self.id, from = %prev, to = %next, "state moved");
        }
    }

    pub fn plotting_progress(&self) -> u8 {
        self.plotting_progress.load(Ordering::Relaxed)
    }

    pub fn update_plotting_progress(&self, progress: u8) {
        self.plotting_progress.store(progress, Ordering::Relaxed);
    }

    pub fn download_url(&self) -> String {
        recover(&self.download_url).clone()
    }

    /// Copies fresh remote fields onto the plot. An empty URL never
    /// overwrites one we already hold.
    pub fn apply_remote(&self, state: RemoteState, plotting_progress: u8, url: &str) {
        self.update_state(state);
        self.update_plotting_progress(plotting_progress);
        if !url.is_empty() {
            let mut current = recover(&self.download_url);
            if current.as_str() != url {
                *current = url.to_string();
            }
        }
    }

    pub fn download_state(&self) -> DownloadState {
        *recover(&self.download_state)
    }

    pub fn update_download_state(&self, next: DownloadState) {
        // the guard is released before any assertion so a transition bug
        // cannot poison the lock for the rest of the process
        let prev = {
            let mut state = recover(&self.download_state);
            let prev = *state;
            if prev == next {
                return;
            }
            *state = next;
            prev
        };
        if !prev.can_transition_to(next) {
            tracing::warn!(
                plot = %self.id,
                from = %prev,
                to = %next,
                "illegal download state transition"
            );
            debug_assert!(
                false,
                "illegal download state transition {prev:?} -> {next:?}"
            );
        }
        tracing::info!(plot = %self.id, from = %prev, to = %next, "download state moved");
    }

    pub fn set_download_enqueued(&self) {
        let state = self.download_state();
        if state == DownloadState::Empty {
            self.update_download_state(DownloadState::Enqueued);
        }
    }

    pub fn download_size(&self) -> u64 {
        self.download_size.load(Ordering::Relaxed)
    }

    pub fn set_download_size(&self, size: u64) {
        self.download_size.store(size, Ordering::Relaxed);
    }

    pub fn download_filename(&self) -> String {
        recover(&self.download_filename).clone()
    }

    pub fn set_download_filename(&self, name: impl Into<String>) {
        *recover(&self.download_filename) = name.into();
    }

    pub fn download_directory(&self) -> Option<PathBuf> {
        recover(&self.download_directory).clone()
    }

    /// Assigns the download directory and moves on to waiting for hashes.
    /// The directory is stable for the plot's lifetime in this process.
    pub fn set_download_directory(&self, dir: PathBuf) {
        let previous = {
            let mut current = recover(&self.download_directory);
            let previous = current.clone();
            *current = Some(dir.clone());
            previous
        };
        debug_assert!(
            previous.is_none() || previous.as_deref() == Some(dir.as_path()),
            "download directory must not change once chosen"
        );
        self.update_download_state(DownloadState::WaitingForHashes);
    }

    /// The absolute path of the (partial) plot file, once a directory and
    /// filename are known.
    pub fn local_path(&self) -> Option<PathBuf> {
        let dir = self.download_directory()?;
        let name = self.download_filename();
        if name.is_empty() {
            return None;
        }
        Some(dir.join(name))
    }

    pub fn required_chunk_count(&self) -> u64 {
        self.download_size().div_ceil(self.chunk_size)
    }

    pub fn chunk_hashes(&self) -> Vec<String> {
        recover(&self.chunk_hashes).clone()
    }

    /// Stores the verification hash list. Fewer hashes than chunks means the
    /// remote is still computing them, so the plot keeps waiting.
    pub fn set_file_hashes(&self, hashes: Vec<String>) {
        let complete = (hashes.len() as u64) >= self.required_chunk_count();
        *recover(&self.chunk_hashes) = hashes;
        if complete && self.download_state() == DownloadState::WaitingForHashes {
            self.update_download_state(DownloadState::NotStarted);
        }
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn set_downloaded_bytes(&self, bytes: u64) {
        self.downloaded_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Bytes still to fetch; what directory admission reserves.
    pub fn remaining_bytes(&self) -> u64 {
        self.download_size().saturating_sub(self.downloaded_bytes())
    }

    pub fn record_downloaded_bytes(&self, bytes: u64) {
        self.record_downloaded_bytes_at(bytes, Instant::now());
    }

    pub(crate) fn record_downloaded_bytes_at(&self, bytes: u64, at: Instant) {
        let mut history = recover(&self.download_history);
        if history.len() >= DOWNLOAD_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(HistoryRecord { bytes, at });
    }

    /// Bytes per second over the sampled window. `None` when there is not
    /// enough history or right after a truncation made the delta negative.
    pub fn download_speed(&self) -> Option<u64> {
        let history = recover(&self.download_history);
        if history.len() < 2 {
            return None;
        }
        let first = history.front().copied().expect("non-empty history");
        let last = history.back().copied().expect("non-empty history");
        if last.bytes < first.bytes {
            return None;
        }
        let elapsed = last.at.saturating_duration_since(first.at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(((last.bytes - first.bytes) as f64 / elapsed) as u64)
    }

    /// Download completion in percent, 0 when the size is still unknown.
    pub fn download_progress(&self) -> f64 {
        let size = self.download_size();
        if size == 0 {
            return 0.0;
        }
        100.0 * self.downloaded_bytes() as f64 / size as f64
    }

    pub fn has_download_error(&self) -> bool {
        self.download_error.load(Ordering::Relaxed)
    }

    pub fn set_download_error(&self) {
        self.download_error.store(true, Ordering::Relaxed);
    }

    pub fn clear_download_error(&self) {
        self.download_error.store(false, Ordering::Relaxed);
    }

    pub fn truncate_from(&self) -> Option<u64> {
        *recover(&self.truncate_from)
    }

    pub fn set_truncate_from(&self, offset: u64) {
        *recover(&self.truncate_from) = Some(offset);
    }

    pub fn take_truncate_from(&self) -> Option<u64> {
        recover(&self.truncate_from).take()
    }

    /// Installs the cancellation handle of the currently-running download,
    /// cancelling any stale predecessor first.
    pub fn set_cancel_token(&self, token: CancellationToken) {
        if let Some(stale) = recover(&self.cancel).replace(token) {
            stale.cancel();
        }
    }

    pub fn cancel_active_download(&self) {
        if let Some(token) = recover(&self.cancel).take() {
            token.cancel();
        }
    }

    pub fn snapshot(&self) -> PlotSnapshot {
        PlotSnapshot {
            id: self.id.clone(),
            remote_state: self.remote_state(),
            plotting_progress: self.plotting_progress(),
            download_state: self.download_state(),
            download_directory: self.download_directory(),
            downloaded_bytes: self.downloaded_bytes(),
            download_size: self.download_size(),
            download_speed: self.download_speed(),
            download_progress: self.download_progress(),
            download_error: self.has_download_error(),
        }
    }
}

impl std::fmt::Debug for Plot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plot")
            .field("id", &self.id)
            .field("state", &self.remote_state())
            .field("download_state", &self.download_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn published_plot() -> Plot {
        Plot::with_chunk_size("p1", RemoteState::Published, "https://dl/p1.plot", 100, 100)
    }

    #[test]
    fn history_ring_keeps_at_most_five_samples() {
        let plot = published_plot();
        let start = Instant::now();
        for i in 0..8u64 {
            plot.record_downloaded_bytes_at(i * 10, start + Duration::from_secs(i));
        }
        let history = plot.download_history.lock().expect("history");
        assert_eq!(history.len(), 5);
        assert_eq!(history.front().expect("front").bytes, 30);
        assert_eq!(history.back().expect("back").bytes, 70);
    }

    #[test]
    fn speed_spans_the_sampled_window() {
        let plot = published_plot();
        let start = Instant::now();
        plot.record_downloaded_bytes_at(0, start);
        plot.record_downloaded_bytes_at(4_000, start + Duration::from_secs(4));
        assert_eq!(plot.download_speed(), Some(1_000));
    }

    #[test]
    fn speed_is_none_without_history_or_after_truncation() {
        let plot = published_plot();
        assert_eq!(plot.download_speed(), None);

        let start = Instant::now();
        plot.record_downloaded_bytes_at(5_000, start);
        assert_eq!(plot.download_speed(), None);

        // a truncation makes the byte counter go backwards
        plot.record_downloaded_bytes_at(100, start + Duration::from_secs(1));
        assert_eq!(plot.download_speed(), None);
    }

    #[test]
    fn hashes_only_advance_state_once_complete() {
        let plot = published_plot();
        plot.set_download_size(250); // 3 chunks of 100
        plot.update_download_state(DownloadState::LookingForDownloadLocation);
        plot.set_download_directory(PathBuf::from("/tmp/plots"));
        assert_eq!(plot.download_state(), DownloadState::WaitingForHashes);

        plot.set_file_hashes(vec!["aa".into(), "bb".into()]);
        assert_eq!(plot.download_state(), DownloadState::WaitingForHashes);

        plot.set_file_hashes(vec!["aa".into(), "bb".into(), "cc".into()]);
        assert_eq!(plot.download_state(), DownloadState::NotStarted);
    }

    #[test]
    fn required_chunk_count_rounds_up() {
        let plot = published_plot();
        plot.set_download_size(250);
        assert_eq!(plot.required_chunk_count(), 3);
        plot.set_download_size(300);
        assert_eq!(plot.required_chunk_count(), 3);
        plot.set_download_size(301);
        assert_eq!(plot.required_chunk_count(), 4);
    }

    #[test]
    fn empty_url_does_not_overwrite_known_url() {
        let plot = published_plot();
        plot.apply_remote(RemoteState::Published, 100, "");
        assert_eq!(plot.download_url(), "https://dl/p1.plot");
        plot.apply_remote(RemoteState::Published, 100, "https://dl/other.plot");
        assert_eq!(plot.download_url(), "https://dl/other.plot");
    }

    #[test]
    fn enqueue_only_applies_to_uninitialized_plots() {
        let plot = published_plot();
        plot.set_download_enqueued();
        assert_eq!(plot.download_state(), DownloadState::Enqueued);

        let busy = published_plot();
        busy.update_download_state(DownloadState::LookingForDownloadLocation);
        busy.set_download_enqueued();
        assert_eq!(
            busy.download_state(),
            DownloadState::LookingForDownloadLocation
        );
    }

    #[test]
    fn remaining_bytes_reflects_progress() {
        let plot = published_plot();
        plot.set_download_size(1_000);
        assert_eq!(plot.remaining_bytes(), 1_000);
        plot.set_downloaded_bytes(400);
        assert_eq!(plot.remaining_bytes(), 600);
    }

    #[test]
    fn poisoned_lock_is_recovered_not_propagated() {
        let plot = std::sync::Arc::new(published_plot());

        // poison the download-state mutex by panicking while holding it
        let poisoner = plot.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.download_state.lock().expect("fresh lock");
            panic!("poison the lock");
        })
        .join();
        assert!(plot.download_state.lock().is_err());

        // accessors keep working on the recovered state
        assert_eq!(plot.download_state(), DownloadState::Empty);
        plot.update_download_state(DownloadState::Enqueued);
        assert_eq!(plot.download_state(), DownloadState::Enqueued);
        let snapshot = plot.snapshot();
        assert_eq!(snapshot.download_state, DownloadState::Enqueued);
    }
}
