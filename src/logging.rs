use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Shows only the tail of a secret, `****xxxx` style, so startup logs can
/// confirm which key is in use without leaking it.
pub fn redact_token(value: &str) -> String {
    if value.len() <= 4 {
        return "****".to_string();
    }
    format!("****{}", &value[value.len() - 4..])
}

/// Rate-limits a warning site. Returns true when the caller should emit the
/// warning now; repeats inside `interval` are suppressed and counted, and
/// the count is reported on the next emission.
pub fn warn_throttled(key: &'static str, interval: Duration) -> bool {
    static SITES: OnceLock<Mutex<HashMap<&'static str, (Instant, u64)>>> = OnceLock::new();
    let sites = SITES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = match sites.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    let now = Instant::now();
    match guard.get_mut(key) {
        Some((last, suppressed)) => {
            if now.saturating_duration_since(*last) < interval {
                *suppressed = suppressed.saturating_add(1);
                return false;
            }
            if *suppressed > 0 {
                tracing::warn!(key, suppressed, "throttled warnings were suppressed");
            }
            *last = now;
            *suppressed = 0;
            true
        }
        None => {
            guard.insert(key, (now, 0));
            true
        }
    }
}

/// Log sink that mirrors every line to stdout and the log file. Rotation and
/// compression of the file are someone else's job; we only append.
#[derive(Clone)]
struct TeeWriter {
    file: Arc<Mutex<File>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = std::io::stdout().write(buf)?;
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(&buf[..written]);
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()?;
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
        Ok(())
    }
}

/// Initialises tracing. Filter priority:
/// 1) RUST_LOG (standard in the Rust ecosystem)
/// 2) debug when --verbose is set
/// 3) info
pub fn init(logs_dir: &Path, verbose: bool) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join("plotpull.log"))?;
    let writer = TeeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string());
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(move || writer.clone())
        .compact()
        .init();
    Ok(())
}
