use crate::cli::Cli;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://chiafactory.com/api/v1";
const DEFAULT_CHECK_FREQUENCY: Duration = Duration::from_secs(5);

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    MissingApiKey,
    MissingOrderId,
    File {
        path: PathBuf,
        source: config::ConfigError,
    },
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingApiKey => write!(f, "--api-key is required"),
            Self::MissingOrderId => write!(f, "--order-id is required"),
            Self::File { path, source } => write!(
                f,
                "there was a problem loading the config file '{}': {source}",
                path.display()
            ),
            Self::CreateDir { path, source } => write!(
                f,
                "the directory '{}' did not exist and could not be created: {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File { source, .. } => Some(source),
            Self::CreateDir { source, .. } => Some(source),
            Self::MissingApiKey | Self::MissingOrderId => None,
        }
    }
}

/// Fully-resolved runtime settings: built-in defaults, overridden by the INI
/// config file, overridden by command-line flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub api_url: String,
    pub order_id: String,
    pub plot_dirs: Vec<PathBuf>,
    pub logs_dir: PathBuf,
    pub check_frequency: Duration,
    pub max_downloads: usize,
    pub verbose: bool,
}

impl Config {
    pub fn load(cli: Cli) -> Result<Self> {
        let file = load_config_file(cli.config.as_deref())?;

        let api_key = cli
            .api_key
            .or_else(|| file_string(file.as_ref(), "api-key"))
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingApiKey)?;
        let order_id = cli
            .order_id
            .or_else(|| file_string(file.as_ref(), "order-id"))
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingOrderId)?;
        let api_url = cli
            .api_url
            .or_else(|| file_string(file.as_ref(), "api-url"))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let plot_dirs = if !cli.plot_dirs.is_empty() {
            cli.plot_dirs
        } else if let Some(listed) = file_string(file.as_ref(), "plot-dir") {
            listed
                .split(',')
                .map(str::trim)
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from)
                .collect()
        } else {
            vec![PathBuf::from("plots")]
        };
        let logs_dir = cli
            .logs_dir
            .or_else(|| file_string(file.as_ref(), "logs-dir").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("logs"));

        let check_frequency = cli
            .plot_check_frequency
            .or_else(|| file_u64(file.as_ref(), "plot-check-frequency"))
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CHECK_FREQUENCY);
        let max_downloads = cli
            .max_downloads
            .or_else(|| file_u64(file.as_ref(), "max-downloads").map(|value| value as usize))
            .unwrap_or(0);
        let verbose = cli.verbose || file_bool(file.as_ref(), "verbose").unwrap_or(false);

        Ok(Self {
            api_key,
            api_url,
            order_id,
            plot_dirs,
            logs_dir,
            check_frequency,
            max_downloads,
            verbose,
        })
    }

    /// Creates the plot and log directories that do not exist yet.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in self.plot_dirs.iter().chain(std::iter::once(&self.logs_dir)) {
            if !dir.exists() {
                tracing::warn!(dir = %dir.display(), "directory does not exist; creating it");
                std::fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

/// Loads the INI file: an explicit `--config` path must parse, the implicit
/// `~/.plotpull` is only read when present.
fn load_config_file(explicit: Option<&Path>) -> Result<Option<config::Config>> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let Some(home) = std::env::var_os("HOME") else {
                return Ok(None);
            };
            let fallback = PathBuf::from(home).join(".plotpull");
            if !fallback.exists() {
                return Ok(None);
            }
            fallback
        }
    };

    let parsed = config::Config::builder()
        .add_source(config::File::from(path.clone()).format(config::FileFormat::Ini))
        .build()
        .map_err(|source| ConfigError::File {
            path: path.clone(),
            source,
        })?;
    tracing::info!(path = %path.display(), "using config file");
    Ok(Some(parsed))
}

fn file_string(file: Option<&config::Config>, key: &str) -> Option<String> {
    file.and_then(|file| file.get_string(key).ok())
}

fn file_u64(file: Option<&config::Config>, key: &str) -> Option<u64> {
    file.and_then(|file| file.get_int(key).ok())
        .and_then(|value| u64::try_from(value).ok())
}

fn file_bool(file: Option<&config::Config>, key: &str) -> Option<bool> {
    file.and_then(|file| file.get_bool(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_ini(contents: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("plotpull-config-{nanos}.ini"));
        std::fs::write(&path, contents).expect("write ini");
        path
    }

    fn base_cli() -> Cli {
        Cli {
            api_key: Some("key".to_string()),
            order_id: Some("order".to_string()),
            ..Cli::default()
        }
    }

    #[test]
    fn defaults_apply_without_a_config_file() {
        let config = Config::load(base_cli()).expect("load");
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.plot_dirs, vec![PathBuf::from("plots")]);
        assert_eq!(config.logs_dir, PathBuf::from("logs"));
        assert_eq!(config.check_frequency, Duration::from_secs(5));
        assert_eq!(config.max_downloads, 0);
        assert!(!config.verbose);
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let cli = Cli {
            order_id: Some("order".to_string()),
            ..Cli::default()
        };
        match Config::load(cli) {
            Err(ConfigError::MissingApiKey) => {}
            other => panic!("expected MissingApiKey, got {other:?}"),
        }
    }

    #[test]
    fn file_values_fill_in_missing_flags() {
        let path = temp_ini(
            "api-key = file-key\n\
             order-id = file-order\n\
             plot-dir = /data/a, /data/b\n\
             plot-check-frequency = 30\n\
             max-downloads = 3\n",
        );
        let cli = Cli {
            config: Some(path.clone()),
            ..Cli::default()
        };
        let config = Config::load(cli).expect("load");
        assert_eq!(config.api_key, "file-key");
        assert_eq!(config.order_id, "file-order");
        assert_eq!(
            config.plot_dirs,
            vec![PathBuf::from("/data/a"), PathBuf::from("/data/b")]
        );
        assert_eq!(config.check_frequency, Duration::from_secs(30));
        assert_eq!(config.max_downloads, 3);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn flags_override_file_values() {
        let path = temp_ini("api-key = file-key\norder-id = file-order\nmax-downloads = 3\n");
        let cli = Cli {
            api_key: Some("flag-key".to_string()),
            order_id: Some("flag-order".to_string()),
            max_downloads: Some(7),
            config: Some(path.clone()),
            ..Cli::default()
        };
        let config = Config::load(cli).expect("load");
        assert_eq!(config.api_key, "flag-key");
        assert_eq!(config.order_id, "flag-order");
        assert_eq!(config.max_downloads, 7);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn explicit_config_file_must_parse() {
        let missing = std::env::temp_dir().join("plotpull-config-does-not-exist.ini");
        let cli = Cli {
            api_key: Some("k".to_string()),
            order_id: Some("o".to_string()),
            config: Some(missing),
            ..Cli::default()
        };
        match Config::load(cli) {
            Err(ConfigError::File { .. }) => {}
            other => panic!("expected File error, got {other:?}"),
        }
    }
}
