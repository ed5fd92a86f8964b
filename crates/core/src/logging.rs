//! Log filter selection and the rolling log file.
//!
//! The console shows what the user asked for. When the level was not chosen
//! explicitly, the log file also records tile scheduling and model/session
//! setup at debug level, so a bad upscale can be traced afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const FALLBACK_FILTER: &str = "info";

const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "tessera";
const LOG_FILE_SUFFIX: &str = "log";
const KEEP_DAILY_FILES: usize = 14;

/// ONNX Runtime reports every graph optimization pass at info.
const QUIET_DIRECTIVES: &[&str] = &["ort=error"];

const FILE_DETAIL_TARGETS: &[&str] = &[
    "tessera_core::tiler",
    "tessera_core::model_store",
    "tessera_core::backend",
];

/// Where the base filter came from, highest precedence first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSource {
    /// `--log-filter`
    Flag(String),
    /// `-v` (debug) or `-vv` and up (trace)
    Verbosity(u8),
    /// `RUST_LOG`
    Env(String),
    Default,
}

impl FilterSource {
    pub fn select(flag: Option<&str>, verbose: u8, env: Option<&str>) -> Self {
        if let Some(flag) = flag {
            Self::Flag(flag.to_string())
        } else if verbose > 0 {
            Self::Verbosity(verbose)
        } else if let Some(env) = env.filter(|e| !e.trim().is_empty()) {
            Self::Env(env.to_string())
        } else {
            Self::Default
        }
    }

    fn base(&self) -> &str {
        match self {
            Self::Flag(filter) | Self::Env(filter) => filter,
            Self::Verbosity(1) => "debug",
            Self::Verbosity(_) => "trace",
            Self::Default => FALLBACK_FILTER,
        }
    }

    /// Flag and verbosity are taken literally on both sinks.
    fn is_explicit(&self) -> bool {
        matches!(self, Self::Flag(_) | Self::Verbosity(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filters {
    pub console: String,
    pub file: String,
}

impl Filters {
    pub fn for_source(source: &FilterSource) -> Self {
        let base = source.base();
        if source.is_explicit() {
            return Self {
                console: base.to_string(),
                file: base.to_string(),
            };
        }

        let mut console: Vec<String> = QUIET_DIRECTIVES.iter().map(|d| d.to_string()).collect();
        let mut file = console.clone();
        file.extend(
            FILE_DETAIL_TARGETS
                .iter()
                .filter(|target| !names_target(base, target))
                .map(|target| format!("{target}=debug")),
        );
        console.push(base.to_string());
        file.push(base.to_string());

        Self {
            console: console.join(","),
            file: file.join(","),
        }
    }
}

/// Whether `filter` already has a directive for exactly `target`.
fn names_target(filter: &str, target: &str) -> bool {
    filter
        .split(',')
        .filter_map(|directive| directive.split_once('='))
        .any(|(t, _)| t.trim() == target)
}

#[derive(Debug)]
pub enum LogSink {
    Rolling {
        dir: PathBuf,
        appender: RollingFileAppender,
    },
    /// The log file could not be opened; `reason` says why.
    ConsoleOnly {
        dir: Option<PathBuf>,
        reason: String,
    },
}

impl LogSink {
    /// Daily-rotated `tessera.*.log` under `<data_dir>/logs`.
    pub fn open(data_dir: Option<&Path>) -> Self {
        let Some(data_dir) = data_dir else {
            return Self::ConsoleOnly {
                dir: None,
                reason: "no data directory".to_string(),
            };
        };

        let dir = data_dir.join(LOG_DIR);
        if let Err(e) = fs::create_dir_all(&dir) {
            return Self::ConsoleOnly {
                reason: format!("cannot create {}: {e}", dir.display()),
                dir: Some(dir),
            };
        }

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix(LOG_FILE_SUFFIX)
            .max_log_files(KEEP_DAILY_FILES)
            .build(&dir);
        match appender {
            Ok(appender) => Self::Rolling { dir, appender },
            Err(e) => Self::ConsoleOnly {
                reason: format!("cannot open log file: {e}"),
                dir: Some(dir),
            },
        }
    }
}

#[derive(Debug)]
pub struct LogPlan {
    pub filters: Filters,
    pub sink: LogSink,
}

pub fn plan_logging(data_dir: Option<&Path>, source: &FilterSource) -> LogPlan {
    LogPlan {
        filters: Filters::for_source(source),
        sink: LogSink::open(data_dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_beats_verbosity_beats_env() {
        assert_eq!(
            FilterSource::select(Some("warn"), 2, Some("error")),
            FilterSource::Flag("warn".into())
        );
        assert_eq!(
            FilterSource::select(None, 1, Some("error")),
            FilterSource::Verbosity(1)
        );
        assert_eq!(
            FilterSource::select(None, 0, Some("error")),
            FilterSource::Env("error".into())
        );
        assert_eq!(FilterSource::select(None, 0, Some("  ")), FilterSource::Default);
    }

    #[test]
    fn explicit_levels_are_used_verbatim() {
        let debug = Filters::for_source(&FilterSource::Verbosity(1));
        assert_eq!(debug.console, "debug");
        assert_eq!(debug.file, "debug");
        assert_eq!(Filters::for_source(&FilterSource::Verbosity(3)).file, "trace");

        let flag = Filters::for_source(&FilterSource::Flag("tessera_core=trace".into()));
        assert_eq!(flag.console, "tessera_core=trace");
        assert_eq!(flag.file, "tessera_core=trace");
    }

    #[test]
    fn default_file_filter_adds_tile_and_session_detail() {
        let filters = Filters::for_source(&FilterSource::Default);
        assert_eq!(filters.console, "ort=error,info");
        assert_eq!(
            filters.file,
            "ort=error,tessera_core::tiler=debug,tessera_core::model_store=debug,\
             tessera_core::backend=debug,info"
        );
    }

    #[test]
    fn env_filter_keeps_its_own_tiler_level() {
        let env = FilterSource::Env("warn,tessera_core::tiler=trace".into());
        let filters = Filters::for_source(&env);
        assert!(!filters.file.contains("tessera_core::tiler=debug"));
        assert!(filters.file.contains("tessera_core::backend=debug"));
        assert!(filters.file.ends_with("warn,tessera_core::tiler=trace"));
        assert_eq!(filters.console, "ort=error,warn,tessera_core::tiler=trace");
    }

    #[test]
    fn sink_rolls_under_data_dir() {
        let data_dir = tempfile::tempdir().unwrap();
        match LogSink::open(Some(data_dir.path())) {
            LogSink::Rolling { dir, .. } => {
                assert_eq!(dir, data_dir.path().join("logs"));
                assert!(dir.is_dir());
            }
            LogSink::ConsoleOnly { reason, .. } => panic!("expected rolling sink: {reason}"),
        }
    }

    #[test]
    fn sink_is_console_only_when_logs_dir_is_blocked() {
        let not_a_dir = tempfile::NamedTempFile::new().unwrap();
        let plan = plan_logging(Some(not_a_dir.path()), &FilterSource::Default);
        match plan.sink {
            LogSink::ConsoleOnly { dir, reason } => {
                assert_eq!(dir, Some(not_a_dir.path().join("logs")));
                assert!(reason.starts_with("cannot create"));
            }
            LogSink::Rolling { .. } => panic!("expected console-only sink"),
        }
        assert!(matches!(
            LogSink::open(None),
            LogSink::ConsoleOnly { dir: None, .. }
        ));
    }
}
