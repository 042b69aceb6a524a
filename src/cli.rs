use clap::Parser;
use std::path::PathBuf;

/// Command line surface. Every value can also come from the INI config file;
/// flags given here win over file values.
#[derive(Parser, Debug, Default)]
#[command(
    name = "plotpull",
    version,
    about = "plotpull automates the download of plots from a plot-order service"
)]
pub struct Cli {
    /// Your personal API key.
    #[arg(long)]
    pub api_key: Option<String>,

    /// The id of the order to process plots for.
    #[arg(long)]
    pub order_id: Option<String>,

    /// Base URL of the remote API.
    #[arg(long)]
    pub api_url: Option<String>,

    /// Where to store downloaded plots. Repeat the flag to spread downloads
    /// over several directories; each is filled before the next is used.
    #[arg(long = "plot-dir")]
    pub plot_dirs: Vec<PathBuf>,

    /// Where to store log files.
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,

    /// Seconds between checks on an order's plots.
    #[arg(long, value_name = "SECONDS")]
    pub plot_check_frequency: Option<u64>,

    /// Maximum number of parallel downloads; 0 means unlimited.
    #[arg(long)]
    pub max_downloads: Option<usize>,

    /// Config file to use (INI).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enables verbose logging (DEBUG level).
    #[arg(short, long)]
    pub verbose: bool,
}
