#[derive(Debug)]
pub enum PlotError {
    /// The download URL has not been assigned or does not parse.
    InvalidDownloadUrl {
        url: String,
    },
    /// The size probe or the download GET failed at the transport level.
    Request {
        url: String,
        source: reqwest::Error,
    },
    /// The server answered with a status the operation cannot accept
    /// (e.g. 200 where a resume expected 206).
    UnexpectedStatus {
        url: String,
        expected: u16,
        got: u16,
    },
    /// The server did not report a Content-Length for the plot file.
    MissingContentLength {
        url: String,
    },
    OpenFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    WriteFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    Truncate {
        path: std::path::PathBuf,
        offset: u64,
        source: std::io::Error,
    },
    /// The body ended before the expected number of bytes arrived.
    ShortBody {
        url: String,
        received: u64,
        expected: u64,
    },
    /// No download directory was assigned before a file operation needed it.
    NoDownloadDirectory,
}

impl std::fmt::Display for PlotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidDownloadUrl { url } => write!(f, "invalid download url '{url}'"),
            Self::Request { url, source } => write!(f, "request to {url} failed: {source}"),
            Self::UnexpectedStatus {
                url,
                expected,
                got,
            } => write!(
                f,
                "invalid status code returned by {url} (expected {expected}, got {got})"
            ),
            Self::MissingContentLength { url } => {
                write!(f, "unable to get the plot file size from {url}")
            }
            Self::OpenFile { path, source } => write!(
                f,
                "could not open '{}' for writing: {source}",
                path.display()
            ),
            Self::ReadFile { path, source } => {
                write!(f, "failed to read '{}': {source}", path.display())
            }
            Self::WriteFile { path, source } => {
                write!(f, "failed to write '{}': {source}", path.display())
            }
            Self::Truncate {
                path,
                offset,
                source,
            } => write!(
                f,
                "failed to truncate '{}' to {offset} bytes: {source}",
                path.display()
            ),
            Self::ShortBody {
                url,
                received,
                expected,
            } => write!(
                f,
                "download from {url} ended early ({received} of {expected} bytes)"
            ),
            Self::NoDownloadDirectory => write!(f, "no download directory assigned"),
        }
    }
}

impl std::error::Error for PlotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request { source, .. } => Some(source),
            Self::OpenFile { source, .. }
            | Self::ReadFile { source, .. }
            | Self::WriteFile { source, .. }
            | Self::Truncate { source, .. } => Some(source),
            Self::InvalidDownloadUrl { .. }
            | Self::UnexpectedStatus { .. }
            | Self::MissingContentLength { .. }
            | Self::ShortBody { .. }
            | Self::NoDownloadDirectory => None,
        }
    }
}
