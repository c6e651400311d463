use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Worker,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Worker => "worker",
        }
    }
}

fn file_prefix(process: ProcessKind) -> String {
    format!("atelier-{}.log", process.as_str())
}

/// How a process writes its logs. Defaults: two weeks of retention, console
/// echo on.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub logs_dir: PathBuf,
    pub retention: Duration,
    pub console: bool,
}

impl LoggingOptions {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            retention: Duration::from_secs(14 * 24 * 3600),
            console: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.console = false;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Where logs can be redirected from outside the process.
pub fn default_logs_dir() -> PathBuf {
    std::env::var_os("ATELIER_LOGS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./logs"))
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub file_prefix: String,
    pub retention_secs: u64,
    pub expired_files_removed: usize,
    pub initialized_at: DateTime<Utc>,
}

/// Keeps the non-blocking appender alive; dropping it flushes buffered
/// lines, so hold it for the life of the process.
pub struct LoggingGuard {
    pub info: LoggingInitInfo,
    _appender: WorkerGuard,
}

/// Install the process-wide subscriber: a daily-rotated JSON file under
/// `logs_dir`, plus a compact console layer unless the options say quiet.
/// Expired log files for this process are swept on the way in.
pub fn init_logging(process: ProcessKind, options: &LoggingOptions) -> anyhow::Result<LoggingGuard> {
    fs::create_dir_all(&options.logs_dir)?;
    let expired_files_removed =
        sweep_expired_logs(&options.logs_dir, process, options.retention)?;

    let prefix = file_prefix(process);
    let file_appender = tracing_appender::rolling::daily(&options.logs_dir, &prefix);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = options
        .console
        .then(|| tracing_subscriber::fmt::layer().compact().with_target(true));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atelier=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .ok();

    Ok(LoggingGuard {
        info: LoggingInitInfo {
            process: process.as_str().to_string(),
            logs_dir: options.logs_dir.display().to_string(),
            file_prefix: prefix,
            retention_secs: options.retention.as_secs(),
            expired_files_removed,
            initialized_at: Utc::now(),
        },
        _appender: guard,
    })
}

/// Remove this process's rotated files whose mtime is past the retention
/// window. Rotation suffixes never need parsing; age comes from the
/// filesystem.
fn sweep_expired_logs(
    logs_dir: &Path,
    process: ProcessKind,
    retention: Duration,
) -> anyhow::Result<usize> {
    let prefix = file_prefix(process);
    let mut removed = 0usize;

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let expired = modified
            .elapsed()
            .map(|age| age >= retention)
            .unwrap_or(false);
        if expired {
            let _ = fs::remove_file(&path);
            removed += 1;
        }
    }

    Ok(removed)
}

/// One structured line on the `atelier::events` target. The whole record is
/// serialized into a single `fields` value so downstream log pipelines get
/// one JSON object per event rather than a flat field soup.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<&'a str>,
}

impl<'a> ObservabilityEvent<'a> {
    pub fn new(event: &'a str, component: &'a str) -> Self {
        Self {
            event,
            component,
            task_id: None,
            template_id: None,
            worker_id: None,
            service: None,
            status: None,
            error_code: None,
            detail: None,
        }
    }

    pub fn task(mut self, task_id: &'a str) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn worker(mut self, worker_id: &'a str) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn status(mut self, status: &'a str) -> Self {
        self.status = Some(status);
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }
}

pub fn emit_event(level: Level, process: ProcessKind, event: &ObservabilityEvent<'_>) {
    let fields = serde_json::to_string(event).unwrap_or_default();
    // tracing macros need a const level, so the dispatch stays explicit.
    match level {
        Level::ERROR => tracing::error!(
            target: "atelier::events",
            process = process.as_str(),
            event = event.event,
            fields = %fields,
            "engine_event"
        ),
        Level::WARN => tracing::warn!(
            target: "atelier::events",
            process = process.as_str(),
            event = event.event,
            fields = %fields,
            "engine_event"
        ),
        _ => tracing::info!(
            target: "atelier::events",
            process = process.as_str(),
            event = event.event,
            fields = %fields,
            "engine_event"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_skips_unset_fields() {
        let event = ObservabilityEvent::new("task.dispatched", "engine.dispatch")
            .task("t-1")
            .status("queued");
        let raw = serde_json::to_string(&event).unwrap();
        assert!(raw.contains("\"task_id\":\"t-1\""));
        assert!(raw.contains("\"status\":\"queued\""));
        assert!(!raw.contains("worker_id"));
        assert!(!raw.contains("error_code"));
    }

    #[test]
    fn zero_retention_sweeps_only_matching_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine_log = tmp.path().join("atelier-engine.log.2026-07-31");
        let worker_log = tmp.path().join("atelier-worker.log.2026-07-31");
        let unrelated = tmp.path().join("notes.txt");
        for path in [&engine_log, &worker_log, &unrelated] {
            fs::write(path, "{}\n").unwrap();
        }

        let removed =
            sweep_expired_logs(tmp.path(), ProcessKind::Engine, Duration::ZERO).unwrap();

        assert_eq!(removed, 1);
        assert!(!engine_log.exists());
        assert!(worker_log.exists(), "other process logs are untouched");
        assert!(unrelated.exists());
    }

    #[test]
    fn fresh_files_survive_a_long_retention() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine_log = tmp.path().join("atelier-engine.log.2026-08-01");
        fs::write(&engine_log, "{}\n").unwrap();

        let removed = sweep_expired_logs(
            tmp.path(),
            ProcessKind::Engine,
            Duration::from_secs(7 * 24 * 3600),
        )
        .unwrap();

        assert_eq!(removed, 0);
        assert!(engine_log.exists());
    }

    #[test]
    fn options_builders_compose() {
        let options = LoggingOptions::new("/var/log/atelier")
            .quiet()
            .with_retention(Duration::from_secs(3600));
        assert!(!options.console);
        assert_eq!(options.retention.as_secs(), 3600);
        assert_eq!(options.logs_dir, PathBuf::from("/var/log/atelier"));
    }

    #[test]
    fn default_logs_dir_falls_back_to_relative_logs() {
        // The env override is exercised by deployments; the default is what
        // tests can assert without mutating process state.
        if std::env::var_os("ATELIER_LOGS_DIR").is_none() {
            assert_eq!(default_logs_dir(), PathBuf::from("./logs"));
        }
    }
}
