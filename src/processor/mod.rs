pub mod admission;

pub use admission::{AllocationError, allocate_directory, download_allowed};

use crate::api::{ApiClient, ApiError, PlotRecord};
use crate::disk::{DiskProbe, SystemProbe};
use crate::logging;
use crate::plot::{CHUNK_SIZE, DownloadState, Plot, RemoteState};
use crate::status::OrderSnapshot;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Directories below this many free bytes trigger a low-space warning.
const MIN_AVAILABLE_SPACE_THRESHOLD: u64 = 1_000_000_000;

/// How long to wait before polling a plot's remote state again. Dispatch
/// picks the cadence per state: plotting progress moves fast enough to show,
/// everything else is worth a look every few minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecheckIntervals {
    pub standard: Duration,
    pub plotting: Duration,
    pub expire_retry: Duration,
}

impl Default for RecheckIntervals {
    fn default() -> Self {
        Self {
            standard: Duration::from_secs(10 * 60),
            plotting: Duration::from_secs(60),
            expire_retry: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub enum ProcessorError {
    Api(ApiError),
    UnknownRemoteState { plot_id: String, code: String },
}

impl std::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api(source) => write!(f, "{source}"),
            Self::UnknownRemoteState { plot_id, code } => {
                write!(f, "unexpected state ('{code}') for plot {plot_id}")
            }
        }
    }
}

impl std::error::Error for ProcessorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Api(source) => Some(source),
            Self::UnknownRemoteState { .. } => None,
        }
    }
}

impl From<ApiError> for ProcessorError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Download roots, tried in order; each is filled before the next.
    pub plot_dirs: Vec<PathBuf>,
    /// The tick interval.
    pub frequency: Duration,
    /// Maximum simultaneous downloads; zero means unlimited.
    pub max_downloads: usize,
    /// Per-state remote polling cadence.
    pub recheck: RecheckIntervals,
}

/// Drives every plot of one order through its download lifecycle: polls the
/// remote on a per-plot schedule, admits downloads under the concurrency cap
/// and the disk-space budget, spawns the per-plot tasks, and publishes a
/// status snapshot each tick.
pub struct Processor {
    api: ApiClient,
    http: reqwest::Client,
    probe: Box<dyn DiskProbe>,
    config: ProcessorConfig,
    chunk_size: u64,
    status: watch::Sender<OrderSnapshot>,
    order_id: String,
    plots: Vec<Arc<Plot>>,
    schedule: HashMap<String, Instant>,
    downloads: TaskTracker,
}

impl Processor {
    pub fn new(
        api: ApiClient,
        config: ProcessorConfig,
        status: watch::Sender<OrderSnapshot>,
    ) -> Self {
        Self {
            api,
            http: reqwest::Client::new(),
            probe: Box::new(SystemProbe),
            config,
            chunk_size: CHUNK_SIZE,
            status,
            order_id: String::new(),
            plots: Vec::new(),
            schedule: HashMap::new(),
            downloads: TaskTracker::new(),
        }
    }

    /// Replaces the free-space probe. The default queries the filesystem.
    pub fn with_probe(mut self, probe: Box<dyn DiskProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Overrides the chunk geometry used for new plots. The default is the
    /// production [`CHUNK_SIZE`].
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Processes the order until the token is cancelled, every plot is
    /// expired or cancelled, or a fatal error occurs. Waits for outstanding
    /// download tasks to flush before returning.
    pub async fn start(&mut self, token: CancellationToken, order_id: &str) -> Result<()> {
        // downloads hang off this scope so that every exit path below stops
        // them before waiting for their buffers to flush
        let token = token.child_token();

        let order = self.api.get_order(order_id).await?;
        // the order response may omit its own id; the requested one stands in
        self.order_id = if order.id.is_empty() {
            order_id.to_string()
        } else {
            order.id
        };
        let records = self.api.get_plots_for_order(&self.order_id).await?;
        self.plots = build_plots(&records, self.chunk_size)?;

        let now = Instant::now();
        for plot in &self.plots {
            self.schedule.insert(plot.id.clone(), now);
        }
        tracing::info!(order = %self.order_id, plots = self.plots.len(), "order loaded");

        let mut ticker = tokio::time::interval(self.config.frequency);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    self.check_disk_pressure(&token);
                    if token.is_cancelled() {
                        break Ok(());
                    }
                    match self.process(&token).await {
                        Ok(true) => {
                            tracing::info!(order = %self.order_id, "every plot is expired or cancelled");
                            break Ok(());
                        }
                        Ok(false) => {}
                        // a cancellation mid-request surfaces as an error; not fatal
                        Err(_) if token.is_cancelled() => break Ok(()),
                        Err(err) => break Err(err),
                    }
                    self.publish_status();
                }
            }
        };

        // stop in-flight downloads and wait for every spawned task so all
        // file buffers are flushed
        token.cancel();
        self.downloads.close();
        self.downloads.wait().await;
        self.publish_status();
        result
    }

    /// Per-tick disk watchdog: a directory with zero free bytes stops the
    /// whole process gracefully, a low one warns.
    fn check_disk_pressure(&self, token: &CancellationToken) {
        for dir in &self.config.plot_dirs {
            let space = match self.probe.probe(dir) {
                Ok(space) => space,
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), error = %err, "error while checking available space");
                    continue;
                }
            };
            if space.available == 0 {
                tracing::warn!(
                    dir = %dir.display(),
                    "no remaining space; all downloads will be stopped and the program will exit"
                );
                token.cancel();
                return;
            }
            if space.available <= MIN_AVAILABLE_SPACE_THRESHOLD
                && logging::warn_throttled("low_disk_space", Duration::from_secs(60))
            {
                tracing::warn!(
                    dir = %dir.display(),
                    remaining = space.available,
                    "directory is running out of space"
                );
            }
        }
    }

    /// One pass over every scheduled plot: refresh from the remote when due,
    /// then advance the download state machine. Returns true when the whole
    /// order is finished.
    async fn process(&mut self, token: &CancellationToken) -> Result<bool> {
        let plots = self.plots.clone();
        for plot in &plots {
            let Some(next_check) = self.schedule.get(&plot.id).copied() else {
                continue;
            };

            let now = Instant::now();
            let mut update_schedule = false;
            if next_check <= now {
                let record = self.api.get_plot(&plot.id).await?;
                let state = parse_remote_state(&record)?;
                plot.apply_remote(state, record.progress, &record.url);
                update_schedule = true;
            }

            let mut next = now + self.config.recheck.standard;
            match plot.remote_state() {
                RemoteState::Pending => {
                    tracing::debug!(plot = %plot.id, "plotting has not started");
                }
                RemoteState::Plotting => {
                    tracing::debug!(
                        plot = %plot.id,
                        progress = plot.plotting_progress(),
                        "currently being plotted"
                    );
                    next = now + self.config.recheck.plotting;
                }
                RemoteState::Published => {
                    self.dispatch_download(plot, now, &mut next, token).await?;
                }
                RemoteState::Cancelled | RemoteState::Expired => {
                    tracing::debug!(plot = %plot.id, "plot is expired or cancelled");
                    self.schedule.remove(&plot.id);
                    update_schedule = false;
                }
            }

            if update_schedule {
                self.schedule.insert(plot.id.clone(), next);
            }
        }

        Ok(self.plots.iter().all(|plot| plot.remote_state().is_terminal()))
    }

    async fn dispatch_download(
        &self,
        plot: &Arc<Plot>,
        now: Instant,
        next: &mut Instant,
        token: &CancellationToken,
    ) -> Result<()> {
        match plot.download_state() {
            DownloadState::Empty | DownloadState::Enqueued => {
                if plot.download_url().is_empty() {
                    tracing::debug!(plot = %plot.id, "published but the download url is not assigned yet");
                    return Ok(());
                }
                if !download_allowed(&self.plots, self.config.max_downloads) {
                    plot.set_download_enqueued();
                    return Ok(());
                }
                tracing::info!(plot = %plot.id, "initialising download");
                if let Err(err) = plot.initialise_download(&self.http).await {
                    tracing::error!(plot = %plot.id, error = %err, "error while initialising the download; retrying");
                    plot.set_download_error();
                }
            }
            DownloadState::LookingForDownloadLocation => {
                tracing::debug!(plot = %plot.id, "looking for an available download directory");
                match allocate_directory(
                    self.probe.as_ref(),
                    &self.plots,
                    &self.config.plot_dirs,
                    plot,
                ) {
                    Ok(dir) => plot.set_download_directory(dir),
                    Err(AllocationError::NotEnoughSpace) => {
                        tracing::error!(plot = %plot.id, "please make room to download this plot");
                        plot.set_download_error();
                    }
                    Err(err) => {
                        tracing::error!(plot = %plot.id, error = %err, "error while choosing a download directory");
                        plot.set_download_error();
                    }
                }
            }
            DownloadState::WaitingForHashes => {
                tracing::debug!(plot = %plot.id, "waiting for the plot verification hashes");
                match self.api.get_hashes_for_plot(&plot.id).await {
                    Ok(hashes) => plot.set_file_hashes(hashes),
                    Err(ApiError::HashesNotReady) => {
                        tracing::warn!(
                            plot = %plot.id,
                            "verification hashes still not ready; waiting for the remote to calculate them"
                        );
                    }
                    Err(err) => {
                        tracing::error!(plot = %plot.id, error = %err, "unexpected error while retrieving verification hashes");
                        plot.set_download_error();
                    }
                }
            }
            DownloadState::NotStarted => {
                plot.update_download_state(DownloadState::Preparing);
                let task_plot = Arc::clone(plot);
                self.spawn_plot_task(Arc::clone(plot), async move {
                    if let Err(err) = task_plot.prepare_download().await {
                        tracing::error!(
                            plot = %task_plot.id,
                            error = %err,
                            "error while preparing the download; retrying"
                        );
                        task_plot.set_download_error();
                        task_plot.update_download_state(DownloadState::Failed);
                    }
                });
            }
            DownloadState::Preparing | DownloadState::InitialValidation => {
                tracing::debug!(plot = %plot.id, "being prepared for download");
            }
            DownloadState::Ready => {
                // the downloader drives itself from here on; flip the state
                // before the task runs so the next tick cannot double-spawn
                *next = now + self.config.recheck.standard;
                plot.update_download_state(DownloadState::Downloading);
                let download_token = token.child_token();
                plot.set_cancel_token(download_token.clone());
                let task_plot = Arc::clone(plot);
                let http = self.http.clone();
                self.spawn_plot_task(Arc::clone(plot), async move {
                    task_plot.download(&http, download_token).await;
                });
            }
            DownloadState::Downloading | DownloadState::LiveValidation => {
                tracing::debug!(
                    plot = %plot.id,
                    progress = format!("{:.2}%", plot.download_progress()),
                    "downloading"
                );
            }
            DownloadState::Failed => {
                tracing::debug!(plot = %plot.id, "download failed; it will be retried");
                plot.retry_download().await;
            }
            DownloadState::FailedValidation => {
                tracing::debug!(plot = %plot.id, "chunk validation failed; it will be re-downloaded");
                plot.retry_download().await;
            }
            DownloadState::Downloaded => {
                *next = now + self.config.recheck.expire_retry;
                tracing::debug!(plot = %plot.id, "download finished; marking it as expired");
                match self.api.expire_plot(&plot.id).await {
                    Ok(record) => match RemoteState::parse(&record.state) {
                        Some(state) => plot.update_state(state),
                        None => {
                            tracing::warn!(
                                plot = %plot.id,
                                code = %record.state,
                                "expire returned an unknown state"
                            );
                        }
                    },
                    Err(err) => {
                        tracing::error!(plot = %plot.id, error = %err, "failed to expire plot; retrying soon");
                    }
                }
            }
        }
        Ok(())
    }

    /// Spawns a per-plot task under the download tracker. A panic inside the
    /// task becomes a Failed transition instead of taking the process down.
    fn spawn_plot_task<F>(&self, plot: Arc<Plot>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.downloads.spawn(async move {
            let inner = tokio::spawn(task);
            if let Err(err) = inner.await
                && err.is_panic()
            {
                tracing::error!(plot = %plot.id, "plot task panicked; marking the download failed");
                plot.update_download_state(DownloadState::Failed);
            }
        });
    }

    fn publish_status(&self) {
        let snapshot = OrderSnapshot {
            order_id: self.order_id.clone(),
            plots: self.plots.iter().map(|plot| plot.snapshot()).collect(),
        };
        let _ = self.status.send(snapshot);
    }
}

fn parse_remote_state(record: &PlotRecord) -> Result<RemoteState> {
    RemoteState::parse(&record.state).ok_or_else(|| ProcessorError::UnknownRemoteState {
        plot_id: record.id.clone(),
        code: record.state.clone(),
    })
}

fn build_plots(records: &[PlotRecord], chunk_size: u64) -> Result<Vec<Arc<Plot>>> {
    records
        .iter()
        .map(|record| {
            let state = parse_remote_state(record)?;
            Ok(Arc::new(Plot::with_chunk_size(
                record.id.clone(),
                state,
                record.url.clone(),
                record.progress,
                chunk_size,
            )))
        })
        .collect()
}
