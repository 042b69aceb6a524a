use crate::disk::{DiskProbe, DiskProbeError};
use crate::plot::{Plot, RemoteState};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, AllocationError>;

#[derive(Debug)]
pub enum AllocationError {
    /// No configured directory can hold the plot (or the directory holding
    /// its partial file cannot hold the rest).
    NotEnoughSpace,
    Probe(DiskProbeError),
}

impl std::fmt::Display for AllocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotEnoughSpace => write!(f, "not enough space to download"),
            Self::Probe(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for AllocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Probe(source) => Some(source),
            Self::NotEnoughSpace => None,
        }
    }
}

impl From<DiskProbeError> for AllocationError {
    fn from(value: DiskProbeError) -> Self {
        Self::Probe(value)
    }
}

/// Free bytes in `dir` minus what in-flight plots assigned to `dir` still
/// have to fetch. Signed: reservations may exceed what the probe reports.
fn uncommitted_space(
    probe: &dyn DiskProbe,
    plots: &[Arc<Plot>],
    dir: &Path,
) -> std::result::Result<i64, DiskProbeError> {
    let space = probe.probe(dir)?;
    let mut available = i64::try_from(space.available).unwrap_or(i64::MAX);
    for plot in plots {
        if plot.download_directory().as_deref() == Some(dir) {
            let remaining = i64::try_from(plot.remaining_bytes()).unwrap_or(i64::MAX);
            available = available.saturating_sub(remaining);
        }
    }
    Ok(available)
}

/// Picks the download directory for `plot`.
///
/// A directory already holding a partial file for the plot wins outright:
/// downloads never move between directories, so if that directory cannot fit
/// the remainder the answer is `NotEnoughSpace` no matter what the others
/// hold. Otherwise directories are filled in configured order.
pub fn allocate_directory(
    probe: &dyn DiskProbe,
    plots: &[Arc<Plot>],
    dirs: &[PathBuf],
    plot: &Plot,
) -> Result<PathBuf> {
    let filename = plot.download_filename();
    let size = plot.download_size();

    for dir in dirs {
        let partial = dir.join(&filename);
        let Ok(meta) = std::fs::metadata(&partial) else {
            continue;
        };
        let remaining = i64::try_from(size.saturating_sub(meta.len())).unwrap_or(i64::MAX);
        let available = uncommitted_space(probe, plots, dir)?;
        if remaining > available {
            tracing::error!(
                plot = %plot.id,
                dir = %dir.display(),
                remaining,
                available,
                "not enough space to resume the download"
            );
            return Err(AllocationError::NotEnoughSpace);
        }
        tracing::info!(
            plot = %plot.id,
            dir = %dir.display(),
            remaining,
            available,
            "resuming from existing file"
        );
        return Ok(dir.clone());
    }

    for dir in dirs {
        let available = uncommitted_space(probe, plots, dir)?;
        if i64::try_from(size).unwrap_or(i64::MAX) > available {
            tracing::warn!(
                plot = %plot.id,
                dir = %dir.display(),
                available,
                plot_size = size,
                "directory does not have enough space"
            );
            continue;
        }
        tracing::info!(
            plot = %plot.id,
            dir = %dir.display(),
            available,
            plot_size = size,
            "directory has enough space to start downloading"
        );
        return Ok(dir.clone());
    }

    tracing::error!(plot = %plot.id, "none of the provided directories has enough space");
    Err(AllocationError::NotEnoughSpace)
}

/// Whether a new download may leave the queue. A Published plot holds a slot
/// from the moment it is initialised until it leaves the Published state;
/// plots parked in Enqueued do not count. A cap of zero means unlimited.
pub fn download_allowed(plots: &[Arc<Plot>], max_downloads: usize) -> bool {
    if max_downloads == 0 {
        return true;
    }
    let in_flight = plots
        .iter()
        .filter(|plot| {
            plot.remote_state() == RemoteState::Published
                && plot.download_state().counts_toward_cap()
        })
        .count();
    in_flight < max_downloads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskSpace;
    use crate::plot::DownloadState;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeProbe {
        space: Mutex<HashMap<PathBuf, u64>>,
    }

    impl FakeProbe {
        fn new(entries: &[(&Path, u64)]) -> Self {
            Self {
                space: Mutex::new(
                    entries
                        .iter()
                        .map(|(dir, bytes)| (dir.to_path_buf(), *bytes))
                        .collect(),
                ),
            }
        }
    }

    impl DiskProbe for FakeProbe {
        fn probe(&self, dir: &Path) -> crate::disk::Result<DiskSpace> {
            let space = self.space.lock().expect("probe lock");
            Ok(DiskSpace {
                available: *space.get(dir).unwrap_or(&0),
                volume_id: dir.display().to_string(),
            })
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("plotpull-admission-{tag}-{nanos}"));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn sized_plot(id: &str, size: u64) -> Arc<Plot> {
        let plot = Plot::with_chunk_size(
            id,
            RemoteState::Published,
            format!("https://dl/{id}.plot"),
            100,
            100,
        );
        plot.set_download_size(size);
        plot.set_download_filename(format!("{id}.plot"));
        Arc::new(plot)
    }

    #[test]
    fn fills_directories_in_configured_order() {
        let d1 = temp_dir("fill-1");
        let d2 = temp_dir("fill-2");
        let dirs = vec![d1.clone(), d2.clone()];
        let probe = FakeProbe::new(&[(&d1, 5_000), (&d2, 50_000)]);

        let plot = sized_plot("p1", 4_000);
        let chosen = allocate_directory(&probe, &[], &dirs, &plot).expect("allocate");
        assert_eq!(chosen, d1);

        let _ = std::fs::remove_dir_all(d1);
        let _ = std::fs::remove_dir_all(d2);
    }

    #[test]
    fn skips_a_full_directory() {
        let d1 = temp_dir("skip-1");
        let d2 = temp_dir("skip-2");
        let dirs = vec![d1.clone(), d2.clone()];
        // d1 has 5 GB free, d2 has 50 GB, the plot needs 25 GB
        let probe = FakeProbe::new(&[(&d1, 5_000_000_000), (&d2, 50_000_000_000)]);

        let plot = sized_plot("p1", 25_000_000_000);
        let chosen = allocate_directory(&probe, &[], &dirs, &plot).expect("allocate");
        assert_eq!(chosen, d2);

        let _ = std::fs::remove_dir_all(d1);
        let _ = std::fs::remove_dir_all(d2);
    }

    #[test]
    fn resume_sticks_to_the_directory_with_the_partial_file() {
        let d1 = temp_dir("resume-1");
        let d2 = temp_dir("resume-2");
        let dirs = vec![d1.clone(), d2.clone()];
        let probe = FakeProbe::new(&[(&d1, 10_000), (&d2, 1_000_000)]);

        let plot = sized_plot("p1", 12_000);
        // 8k already on disk in d2; d1 would also fit the remainder
        std::fs::write(d2.join("p1.plot"), vec![0u8; 8_000]).expect("partial");

        let chosen = allocate_directory(&probe, &[], &dirs, &plot).expect("allocate");
        assert_eq!(chosen, d2);

        let _ = std::fs::remove_dir_all(d1);
        let _ = std::fs::remove_dir_all(d2);
    }

    #[test]
    fn resume_directory_without_space_is_an_error_not_a_move() {
        let d1 = temp_dir("stuck-1");
        let d2 = temp_dir("stuck-2");
        let dirs = vec![d1.clone(), d2.clone()];
        // the partial lives in d1 but d1 can no longer hold the remainder
        let probe = FakeProbe::new(&[(&d1, 1_000), (&d2, 1_000_000)]);

        let plot = sized_plot("p1", 50_000);
        std::fs::write(d1.join("p1.plot"), vec![0u8; 10_000]).expect("partial");

        match allocate_directory(&probe, &[], &dirs, &plot) {
            Err(AllocationError::NotEnoughSpace) => {}
            other => panic!("expected NotEnoughSpace, got {other:?}"),
        }

        let _ = std::fs::remove_dir_all(d1);
        let _ = std::fs::remove_dir_all(d2);
    }

    #[test]
    fn reservations_of_other_plots_reduce_availability() {
        let d1 = temp_dir("reserve-1");
        let dirs = vec![d1.clone()];
        let probe = FakeProbe::new(&[(&d1, 30_000)]);

        let committed = sized_plot("p0", 25_000);
        committed.update_download_state(DownloadState::LookingForDownloadLocation);
        committed.set_download_directory(d1.clone());

        // 30k free minus 25k reserved leaves no room for 10k more
        let plot = sized_plot("p1", 10_000);
        match allocate_directory(&probe, &[committed.clone()], &dirs, &plot) {
            Err(AllocationError::NotEnoughSpace) => {}
            other => panic!("expected NotEnoughSpace, got {other:?}"),
        }

        // once the committed plot has fetched most of its bytes, room opens up
        committed.set_downloaded_bytes(22_000);
        let chosen =
            allocate_directory(&probe, &[committed], &dirs, &plot).expect("allocate");
        assert_eq!(chosen, d1);

        let _ = std::fs::remove_dir_all(d1);
    }

    #[test]
    fn zero_cap_means_unlimited() {
        let plots: Vec<Arc<Plot>> = (0..10)
            .map(|i| {
                let plot = sized_plot(&format!("p{i}"), 100);
                plot.update_download_state(DownloadState::LookingForDownloadLocation);
                plot
            })
            .collect();
        assert!(download_allowed(&plots, 0));
    }

    #[test]
    fn enqueued_plots_do_not_hold_slots() {
        let active = sized_plot("p0", 100);
        active.update_download_state(DownloadState::LookingForDownloadLocation);
        let parked = sized_plot("p1", 100);
        parked.update_download_state(DownloadState::Enqueued);

        let plots = vec![active, parked];
        assert!(download_allowed(&plots, 2));
        assert!(!download_allowed(&plots, 1));
    }

    #[test]
    fn only_published_plots_count() {
        let plotting = Arc::new(Plot::new("p0", RemoteState::Plotting, "", 50));
        let plots = vec![plotting];
        assert!(download_allowed(&plots, 1));
    }
}
