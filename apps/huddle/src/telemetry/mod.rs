use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::BTreeMap;

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

static PERF_ENABLED: Lazy<bool> = Lazy::new(|| env_truthy("HUDDLE_PERF").unwrap_or(false));

static COUNTERS: Lazy<Mutex<BTreeMap<&'static str, u64>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

static GAUGES: Lazy<Mutex<BTreeMap<&'static str, GaugeStat>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

#[derive(Default, Clone, Copy)]
struct GaugeStat {
    last: u64,
    max: u64,
    samples: u64,
}

pub fn enabled() -> bool {
    *PERF_ENABLED
}

pub fn record_count(label: &'static str) {
    if !enabled() {
        return;
    }
    let mut counters = COUNTERS.lock();
    let entry = counters.entry(label).or_default();
    *entry = entry.saturating_add(1);
}

pub fn record_gauge(label: &'static str, value: u64) {
    if !enabled() {
        return;
    }
    let mut gauges = GAUGES.lock();
    let entry = gauges.entry(label).or_default();
    entry.last = value;
    entry.max = entry.max.max(value);
    entry.samples = entry.samples.saturating_add(1);
    if entry.samples % 200 == 0 {
        eprintln!(
            "[perf] {label}: gauge={} max={} samples={}",
            entry.last, entry.max, entry.samples
        );
    }
}

/// One line per counter and gauge, sorted by label. Empty when perf is off.
pub fn summary() -> Vec<String> {
    if !enabled() {
        return Vec::new();
    }
    let mut lines: Vec<String> = COUNTERS
        .lock()
        .iter()
        .map(|(label, count)| format!("{label}: count={count}"))
        .collect();
    lines.extend(GAUGES.lock().iter().map(|(label, gauge)| {
        format!(
            "{label}: gauge={} max={} samples={}",
            gauge.last, gauge.max, gauge.samples
        )
    }));
    lines
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }

        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let env_filter = build_env_filter(config.level.to_filter());

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        if let Ok(filter) = std::env::var("HUDDLE_LOG_FILTER") {
            return EnvFilter::new(filter);
        }
        EnvFilter::new(default_filter_for(level))
    }

    fn default_filter_for(level: LevelFilter) -> String {
        let base = match level {
            LevelFilter::TRACE => "info,huddle_client_core=trace,huddle=trace,room_bus=trace",
            LevelFilter::DEBUG => "info,huddle_client_core=debug,huddle=debug,room_bus=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        let mut filter = base.to_owned();
        if level == LevelFilter::TRACE {
            // Frame-level websocket traces drown the room events.
            for target in ["tokio_tungstenite", "tungstenite", "mio"] {
                filter.push(',');
                filter.push_str(target);
                filter.push_str("=info");
            }
        }
        filter
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn trace_level_throttles_websocket_noise() {
            let filter = default_filter_for(LevelFilter::TRACE);
            assert!(filter.starts_with("info,huddle_client_core=trace"));
            assert!(filter.ends_with("tungstenite=info,mio=info"));
            assert_eq!(default_filter_for(LevelFilter::WARN), "warn");
        }
    }
}
