use std::path::Path;

pub type Result<T> = std::result::Result<T, DiskProbeError>;

#[derive(Debug)]
pub enum DiskProbeError {
    Probe {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for DiskProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe { path, source } => {
                write!(f, "failed to probe '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for DiskProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Probe { source, .. } => Some(source),
        }
    }
}

/// The result of probing a download directory: how many bytes are free, and a
/// string identifying the free-space pool the directory lives on. Two
/// directories share `volume_id` iff filling one fills the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpace {
    pub available: u64,
    pub volume_id: String,
}

/// Free-space query for a directory. Results are authoritative per call and
/// never cached; callers re-probe before every admission decision.
pub trait DiskProbe: Send + Sync {
    fn probe(&self, dir: &Path) -> Result<DiskSpace>;
}

/// The real filesystem probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl DiskProbe for SystemProbe {
    fn probe(&self, dir: &Path) -> Result<DiskSpace> {
        let available = fs2::available_space(dir).map_err(|source| DiskProbeError::Probe {
            path: dir.to_path_buf(),
            source,
        })?;
        let volume_id = volume_id(dir).map_err(|source| DiskProbeError::Probe {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(DiskSpace {
            available,
            volume_id,
        })
    }
}

#[cfg(unix)]
fn volume_id(dir: &Path) -> std::io::Result<String> {
    use std::os::unix::fs::MetadataExt as _;
    let meta = std::fs::metadata(dir)?;
    Ok(meta.dev().to_string())
}

#[cfg(windows)]
fn volume_id(dir: &Path) -> std::io::Result<String> {
    // The drive prefix is a good-enough identity for free-space accounting:
    // two paths on the same drive letter share the pool.
    let canonical = std::fs::canonicalize(dir)?;
    let mut components = canonical.components();
    match components.next() {
        Some(prefix) => Ok(prefix.as_os_str().to_string_lossy().into_owned()),
        None => Err(std::io::Error::other("path has no root component")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reports_space_for_temp_dir() {
        let space = SystemProbe.probe(&std::env::temp_dir()).expect("probe");
        assert!(space.available > 0);
        assert!(!space.volume_id.is_empty());
    }

    #[test]
    fn same_directory_probes_to_same_volume() {
        let tmp = std::env::temp_dir();
        let a = SystemProbe.probe(&tmp).expect("probe a");
        let b = SystemProbe.probe(&tmp).expect("probe b");
        assert_eq!(a.volume_id, b.volume_id);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let missing = std::env::temp_dir().join("plotpull-disk-probe-does-not-exist");
        assert!(SystemProbe.probe(&missing).is_err());
    }
}
