use crate::hash;
use crate::plot::entity::Plot;
use crate::plot::errors::PlotError;
use crate::plot::state::DownloadState;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, PlotError>;

/// Bytes are copied from the response body to the buffered writer in blocks
/// of this size.
const WRITE_BLOCK_SIZE: usize = 8 * 1024;

/// How a download attempt ended. `Cancelled` leaves the plot in Downloading
/// for the orchestration loop to re-drive; everything else maps to a state
/// transition in [`Plot::download`].
enum DownloadEnd {
    Finished,
    Cancelled,
    ChunkMismatch,
    Failed(PlotError),
}

impl Plot {
    /// Probes the download URL with a HEAD request to learn the file size
    /// and filename, then moves to looking for a download location.
    pub async fn initialise_download(&self, http: &reqwest::Client) -> Result<()> {
        let url = self.download_url();
        let parsed = url::Url::parse(&url).map_err(|_| PlotError::InvalidDownloadUrl {
            url: url.clone(),
        })?;
        let filename = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PlotError::InvalidDownloadUrl { url: url.clone() })?;

        let response = http
            .head(parsed)
            .send()
            .await
            .map_err(|source| PlotError::Request {
                url: url.clone(),
                source,
            })?;
        if response.status() != StatusCode::OK {
            return Err(PlotError::UnexpectedStatus {
                url,
                expected: StatusCode::OK.as_u16(),
                got: response.status().as_u16(),
            });
        }
        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or(PlotError::MissingContentLength { url })?;

        self.set_download_size(size);
        self.set_download_filename(filename);
        self.update_download_state(DownloadState::LookingForDownloadLocation);
        Ok(())
    }

    /// Opens (or creates) the partial file and verifies the last complete
    /// chunk on disk so a resume never trusts corrupted bytes.
    pub async fn prepare_download(&self) -> Result<()> {
        self.clear_download_error();
        let path = self.local_path().ok_or(PlotError::NoDownloadDirectory)?;
        let file = open_plot_file(&path).await?;
        let existing = file
            .metadata()
            .await
            .map_err(|source| PlotError::ReadFile {
                path: path.clone(),
                source,
            })?
            .len();
        self.set_downloaded_bytes(existing);
        *self.file.lock().await = Some(file);

        let size = self.download_size();
        let chunk_size = self.chunk_size();

        if existing > size {
            // The file on disk is longer than the remote says it should be.
            // Nothing past `size` can be valid, so start over.
            tracing::warn!(
                plot = %self.id,
                file_size = existing,
                download_size = size,
                "partial file is larger than the plot; re-downloading"
            );
            self.set_truncate_from(0);
            self.update_download_state(DownloadState::InitialValidation);
            self.update_download_state(DownloadState::FailedValidation);
            return Ok(());
        }
        if existing == size {
            self.update_download_state(DownloadState::Downloaded);
            return Ok(());
        }
        if existing == 0 || existing < chunk_size {
            // no full chunk on disk yet, nothing to verify
            self.update_download_state(DownloadState::Ready);
            return Ok(());
        }

        let last_full = existing / chunk_size - 1;
        self.update_download_state(DownloadState::InitialValidation);
        tracing::info!(plot = %self.id, chunk = last_full, "validating the last chunk before resuming");
        if self.validate_chunk(&path, last_full).await? {
            self.update_download_state(DownloadState::Ready);
        } else {
            self.set_truncate_from(last_full * chunk_size);
            self.update_download_state(DownloadState::FailedValidation);
        }
        Ok(())
    }

    /// Streams the plot file to disk, resuming from the current file length
    /// and validating every chunk as its last byte arrives. Runs as a
    /// background task; all outcomes are reported through the download state.
    pub async fn download(self: Arc<Self>, http: &reqwest::Client, token: CancellationToken) {
        let Some(path) = self.local_path() else {
            tracing::error!(plot = %self.id, "download started without a directory");
            self.update_download_state(DownloadState::Failed);
            return;
        };

        // The guard is held for the whole download: one downloader per plot.
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            // a failed preparation can leave no handle behind; reopen
            match open_plot_file(&path).await {
                Ok(file) => *guard = Some(file),
                Err(err) => {
                    tracing::error!(plot = %self.id, error = %err, "could not open plot file");
                    self.update_download_state(DownloadState::Failed);
                    return;
                }
            }
        }
        let file = guard.take().expect("file handle present");
        self.update_download_state(DownloadState::Downloading);

        let sampler_token = CancellationToken::new();
        let sampler = tokio::spawn(sample_progress(Arc::clone(&self), sampler_token.clone()));

        let (end, file_back) = self.run_download(file, &path, http, &token).await;
        sampler_token.cancel();
        let _ = sampler.await;
        // a finished plot no longer needs the handle
        *guard = if matches!(end, DownloadEnd::Finished) {
            None
        } else {
            file_back
        };
        drop(guard);

        match end {
            DownloadEnd::Finished => {
                self.record_downloaded_bytes(self.downloaded_bytes());
                tracing::info!(plot = %self.id, "download finished");
                self.update_download_state(DownloadState::Downloaded);
            }
            DownloadEnd::Cancelled => {
                tracing::info!(
                    plot = %self.id,
                    downloaded = self.downloaded_bytes(),
                    "download was aborted"
                );
            }
            DownloadEnd::ChunkMismatch => {
                tracing::error!(
                    plot = %self.id,
                    "the last downloaded chunk was corrupted; it will be downloaded again"
                );
                self.update_download_state(DownloadState::FailedValidation);
            }
            DownloadEnd::Failed(err) => {
                tracing::error!(plot = %self.id, error = %err, "download failed");
                self.update_download_state(DownloadState::Failed);
            }
        }
    }

    /// Cancels any in-flight download, waits for it to release the file, and
    /// returns the plot to Ready for the next tick to re-drive.
    pub async fn retry_download(&self) {
        self.cancel_active_download();
        // taking the file lock waits out the active download task
        drop(self.file.lock().await);
        self.clear_download_error();
        self.update_download_state(DownloadState::Ready);
    }

    async fn run_download(
        &self,
        mut file: File,
        path: &Path,
        http: &reqwest::Client,
        token: &CancellationToken,
    ) -> (DownloadEnd, Option<File>) {
        // apply the truncation a failed validation asked for
        if let Some(offset) = self.take_truncate_from() {
            tracing::info!(plot = %self.id, offset, "truncating before resume");
            if let Err(source) = file.set_len(offset).await {
                return (
                    DownloadEnd::Failed(PlotError::Truncate {
                        path: path.to_path_buf(),
                        offset,
                        source,
                    }),
                    Some(file),
                );
            }
            if let Err(source) = file.seek(std::io::SeekFrom::Start(offset)).await {
                return (
                    DownloadEnd::Failed(PlotError::ReadFile {
                        path: path.to_path_buf(),
                        source,
                    }),
                    Some(file),
                );
            }
        }

        let resume_from = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(source) => {
                return (
                    DownloadEnd::Failed(PlotError::ReadFile {
                        path: path.to_path_buf(),
                        source,
                    }),
                    Some(file),
                );
            }
        };
        self.set_downloaded_bytes(resume_from);

        let url = self.download_url();
        let mut request = http.get(&url);
        let expected = if resume_from > 0 {
            tracing::info!(
                plot = %self.id,
                resume_from,
                url = %url,
                path = %path.display(),
                "resuming download"
            );
            request = request.header(RANGE, format!("bytes={resume_from}-"));
            StatusCode::PARTIAL_CONTENT
        } else {
            tracing::info!(plot = %self.id, url = %url, path = %path.display(), "starting download");
            StatusCode::OK
        };

        let mut response = tokio::select! {
            _ = token.cancelled() => return (DownloadEnd::Cancelled, Some(file)),
            sent = request.send() => match sent {
                Ok(response) => response,
                Err(source) => {
                    return (
                        DownloadEnd::Failed(PlotError::Request { url, source }),
                        Some(file),
                    );
                }
            },
        };
        if response.status() != expected {
            return (
                DownloadEnd::Failed(PlotError::UnexpectedStatus {
                    url,
                    expected: expected.as_u16(),
                    got: response.status().as_u16(),
                }),
                Some(file),
            );
        }

        // reconcile the total size against what this response claims
        if let Some(remaining) = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
        {
            let total = resume_from + remaining;
            if total != self.download_size() {
                tracing::warn!(
                    plot = %self.id,
                    probed = self.download_size(),
                    reported = total,
                    "plot size changed between probe and download"
                );
                self.set_download_size(total);
            }
        }

        let size = self.download_size();
        let chunk_size = self.chunk_size();
        let mut downloaded = resume_from;
        // chunks before the resume point were validated on previous runs or
        // during preparation
        let mut validated_chunks = resume_from / chunk_size;
        let mut writer = BufWriter::with_capacity(WRITE_BLOCK_SIZE, file);

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => {
                    let file = match flush_and_unwrap(writer, path).await {
                        Ok(file) => Some(file),
                        Err(_) => None,
                    };
                    return (DownloadEnd::Cancelled, file);
                }
                read = response.chunk() => read,
            };
            let bytes = match next {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(source) => {
                    let file = flush_and_unwrap(writer, path).await.ok();
                    return (
                        DownloadEnd::Failed(PlotError::Request { url, source }),
                        file,
                    );
                }
            };

            let mut rest = &bytes[..];
            while !rest.is_empty() {
                // a response chunk can span many write blocks; honour
                // cancellation before every write, not just per chunk
                if token.is_cancelled() {
                    let file = flush_and_unwrap(writer, path).await.ok();
                    return (DownloadEnd::Cancelled, file);
                }
                let boundary = (validated_chunks + 1) * chunk_size;
                let take = (rest.len() as u64)
                    .min(WRITE_BLOCK_SIZE as u64)
                    .min(boundary - downloaded) as usize;
                if let Err(source) = writer.write_all(&rest[..take]).await {
                    return (
                        DownloadEnd::Failed(PlotError::WriteFile {
                            path: path.to_path_buf(),
                            source,
                        }),
                        None,
                    );
                }
                downloaded += take as u64;
                self.set_downloaded_bytes(downloaded);
                rest = &rest[take..];

                if downloaded == boundary {
                    if let Err(end) = self
                        .validate_live_chunk(&mut writer, path, validated_chunks, token)
                        .await
                    {
                        let file = flush_and_unwrap(writer, path).await.ok();
                        return (end, file);
                    }
                    validated_chunks += 1;
                }
            }
        }

        if downloaded != size {
            let file = flush_and_unwrap(writer, path).await.ok();
            return (
                DownloadEnd::Failed(PlotError::ShortBody {
                    url,
                    received: downloaded,
                    expected: size,
                }),
                file,
            );
        }

        // the final chunk may be short and never hits a boundary
        if validated_chunks < self.required_chunk_count()
            && let Err(end) = self
                .validate_live_chunk(&mut writer, path, validated_chunks, token)
                .await
        {
            let file = flush_and_unwrap(writer, path).await.ok();
            return (end, file);
        }

        match flush_and_unwrap(writer, path).await {
            Ok(file) => (DownloadEnd::Finished, Some(file)),
            Err(err) => (DownloadEnd::Failed(err), None),
        }
    }

    /// Pauses the writer, re-reads the just-completed chunk through a second
    /// independent handle and compares it against the published hash.
    async fn validate_live_chunk(
        &self,
        writer: &mut BufWriter<File>,
        path: &Path,
        chunk_index: u64,
        token: &CancellationToken,
    ) -> std::result::Result<(), DownloadEnd> {
        if let Err(source) = writer.flush().await {
            return Err(DownloadEnd::Failed(PlotError::WriteFile {
                path: path.to_path_buf(),
                source,
            }));
        }
        self.update_download_state(DownloadState::LiveValidation);
        tracing::info!(plot = %self.id, chunk = chunk_index, "validating chunk");

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                self.update_download_state(DownloadState::Downloading);
                return Err(DownloadEnd::Cancelled);
            }
            validated = self.validate_chunk(path, chunk_index) => validated,
        };
        match outcome {
            Ok(true) => {
                self.update_download_state(DownloadState::Downloading);
                Ok(())
            }
            Ok(false) => {
                self.set_truncate_from(chunk_index * self.chunk_size());
                Err(DownloadEnd::ChunkMismatch)
            }
            Err(err) => Err(DownloadEnd::Failed(err)),
        }
    }

    /// Hashes chunk `chunk_index` of the on-disk file and compares it with
    /// the published digest. Uses its own read handle so it can seek without
    /// disturbing the writer.
    async fn validate_chunk(&self, path: &Path, chunk_index: u64) -> Result<bool> {
        let hashes = self.chunk_hashes();
        let Some(expected) = hashes.get(chunk_index as usize) else {
            return Ok(false);
        };
        let chunk_size = self.chunk_size();
        let start = chunk_index * chunk_size;
        let limit = chunk_size.min(self.download_size().saturating_sub(start));

        let mut reader = File::open(path)
            .await
            .map_err(|source| PlotError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
        reader
            .seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|source| PlotError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
        let digest =
            hash::hash_chunk(reader, limit)
                .await
                .map_err(|source| PlotError::ReadFile {
                    path: path.to_path_buf(),
                    source,
                })?;
        Ok(digest.eq_ignore_ascii_case(expected))
    }
}

/// Opens the partial file: append to an existing one, create-exclusive
/// otherwise.
async fn open_plot_file(path: &Path) -> Result<File> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|source| PlotError::OpenFile {
            path: path.to_path_buf(),
            source,
        })?;
    let mut options = OpenOptions::new();
    options.read(true);
    if exists {
        options.write(true).append(true);
    } else {
        options.write(true).create_new(true);
    }
    options
        .open(path)
        .await
        .map_err(|source| PlotError::OpenFile {
            path: path.to_path_buf(),
            source,
        })
}

async fn flush_and_unwrap(mut writer: BufWriter<File>, path: &Path) -> Result<File> {
    writer
        .flush()
        .await
        .map_err(|source| PlotError::WriteFile {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(writer.into_inner())
}

/// Samples the byte counter once per second into the speed history while a
/// download runs.
async fn sample_progress(plot: Arc<Plot>, token: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {
                plot.record_downloaded_bytes(plot.downloaded_bytes());
            }
        }
    }
}
