/// Remote plot lifecycle, mirroring the one-letter codes the service uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Pending,
    Plotting,
    Published,
    Cancelled,
    Expired,
}

impl RemoteState {
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "P" => Some(Self::Pending),
            "R" => Some(Self::Plotting),
            "D" => Some(Self::Published),
            "C" => Some(Self::Cancelled),
            "X" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Pending => "P",
            Self::Plotting => "R",
            Self::Published => "D",
            Self::Cancelled => "C",
            Self::Expired => "X",
        }
    }

    /// Plots in these states need no further work and leave the schedule.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

impl std::fmt::Display for RemoteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Plotting => "plotting",
            Self::Published => "published",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Local download lifecycle for one plot. `Empty` is the never-initialized
/// starting point; everything else is driven by the processor loop and the
/// per-plot tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DownloadState {
    #[default]
    Empty,
    /// Initialization deferred: the concurrency cap is saturated.
    Enqueued,
    /// Size and filename known; a download directory is still needed.
    LookingForDownloadLocation,
    /// Directory chosen; the remote has not published chunk hashes yet.
    WaitingForHashes,
    /// Hashes present; ready for preparation.
    NotStarted,
    /// Verifying any existing partial file.
    Preparing,
    /// Sub-state of Preparing: the last complete chunk is being hashed.
    InitialValidation,
    /// May be downloaded.
    Ready,
    /// Streaming bytes from the server.
    Downloading,
    /// Sub-state of Downloading: a just-completed chunk is being hashed.
    LiveValidation,
    /// A chunk did not match; the file will be truncated and retried.
    FailedValidation,
    /// File complete and fully validated.
    Downloaded,
    /// Transient failure during preparation or download; retry is appropriate.
    Failed,
}

impl DownloadState {
    /// Whether a Published plot in this state occupies a download slot.
    /// `Enqueued` is explicitly the state of *not* holding a slot.
    pub fn counts_toward_cap(&self) -> bool {
        !matches!(self, Self::Empty | Self::Enqueued)
    }

    /// Legal edges of the download state machine. An illegal transition is a
    /// programmer bug; callers debug-assert on this and log at runtime.
    pub fn can_transition_to(&self, next: DownloadState) -> bool {
        use DownloadState::*;
        matches!(
            (*self, next),
            (Empty, Enqueued)
                | (Empty, LookingForDownloadLocation)
                | (Enqueued, LookingForDownloadLocation)
                | (LookingForDownloadLocation, WaitingForHashes)
                | (WaitingForHashes, NotStarted)
                | (NotStarted, Preparing)
                | (Preparing, InitialValidation)
                | (Preparing, Ready)
                | (Preparing, Downloaded)
                | (Preparing, Failed)
                | (InitialValidation, Ready)
                | (InitialValidation, FailedValidation)
                | (InitialValidation, Failed)
                | (Ready, Downloading)
                | (Downloading, LiveValidation)
                | (Downloading, Downloaded)
                | (Downloading, Failed)
                | (LiveValidation, Downloading)
                | (LiveValidation, FailedValidation)
                | (LiveValidation, Failed)
                | (Failed, Ready)
                | (FailedValidation, Ready)
        )
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Empty => "",
            Self::Enqueued => "ENQUEUED",
            Self::LookingForDownloadLocation => "LOOKING_FOR_DOWNLOAD_LOCATION",
            Self::WaitingForHashes => "WAITING_FOR_HASHES",
            Self::NotStarted => "NOT_STARTED",
            Self::Preparing => "PREPARING",
            Self::InitialValidation => "INITIAL_VALIDATION",
            Self::Ready => "READY",
            Self::Downloading => "DOWNLOADING",
            Self::LiveValidation => "LIVE_VALIDATION",
            Self::FailedValidation => "FAILED_VALIDATION",
            Self::Downloaded => "DOWNLOADED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
