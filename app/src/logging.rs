use log::LevelFilter;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use env_logger::{Builder, Target};

/// Global timestamp for delta calculation
static LAST_LOG: Mutex<Option<Instant>> = Mutex::new(None);

/// Level for a `-v` count: none is info, one is debug, more is trace
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Initialize the logger with delta timestamps.
///
/// Logs go to stderr so stdout stays free for status output. `RUST_LOG`
/// overrides `level`.
pub fn init(level: LevelFilter) {
    let result = Builder::new()
        .target(Target::Stderr)
        .format(|buf, record| {
            use std::io::Write;

            let now = Instant::now();
            let mut last = LAST_LOG.lock().unwrap_or_else(PoisonError::into_inner);
            let delta = last.map(|t| now.duration_since(t).as_millis()).unwrap_or(0);
            *last = Some(now);

            writeln!(
                buf,
                "{} [+{} ms] [{}] {} - {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                delta,
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter_level(level)
        .parse_default_env()
        .try_init();

    if result.is_err() {
        log::debug!("Logger already initialized");
    }
}
