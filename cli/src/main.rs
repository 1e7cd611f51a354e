//! childlink worker - binary entry point.
//!
//! ```text
//! main() -> config + tracing -> exit watcher -> connect_to_runner()
//!                                                   |
//!                               None: exit(1) <-----+-----> request: run, report_result
//!                                                                |
//!                                                   drop connection (reply sent), exit
//! ```
//!
//! The runner passes its channel with `--runner-channel <token>`. A fatal
//! condition raised by the controller (runner-requested exit, lost
//! connection) terminates the process from the shutdown watcher thread.

use anyhow::{Context, Result};
use std::{
    env,
    fs::{self, OpenOptions},
    path::Path,
    sync::Mutex,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use childlink_config::{ChildConfig, LoggingConfig};
use childlink_runner::{AppResult, ConnectionOptions, ServiceRequest, connect_to_runner, fatal_channel};

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = build_env_filter(logging.filter.as_deref());

    let Some(path) = logging.file.as_deref() else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
        return;
    };

    match open_log_file(path) {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(env_filter)
                .init();
            tracing::info!(path = %path.display(), "Logging initialized");
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(env_filter)
                .init();
            tracing::warn!("{e:#}");
        }
    }
}

/// `RUST_LOG` first, then the configured directive, then `info`.
fn build_env_filter(configured: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| configured.map_or_else(|| EnvFilter::try_new("info"), EnvFilter::try_new))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn open_log_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Leave immediately with `code`, skipping destructors and atexit handlers.
fn terminate(code: i32) -> ! {
    #[cfg(unix)]
    // SAFETY: `_exit` takes no pointers and never returns.
    unsafe {
        libc::_exit(code)
    }
    #[cfg(not(unix))]
    std::process::exit(code)
}

fn run_application(request: &ServiceRequest) -> AppResult {
    tracing::info!(
        url = %request.url(),
        qualifier = request.qualifier(),
        user_id = request.user_id(),
        "Application request received"
    );
    AppResult::Ok
}

fn main() -> Result<()> {
    // Tracing needs the logging section, so load before the subscriber
    // exists and settle (logging any load error) afterwards.
    let loaded = ChildConfig::load();
    let logging = match &loaded {
        Ok(Some(config)) => config.logging().clone(),
        Ok(None) | Err(_) => LoggingConfig::default(),
    };
    init_tracing(&logging);
    let config = ChildConfig::resolve_from(loaded, |key| env::var(key).ok());
    let runner = config.runner();

    let options =
        ConnectionOptions::from_env().with_thread_name(runner.controller_thread_name());
    let (fatal, coordinator) = fatal_channel();
    let watcher = coordinator
        .spawn_exit_watcher(|code| terminate(code))
        .context("Failed to start shutdown watcher")?;

    let Some((connection, request)) =
        connect_to_runner(None, runner.exit_on_error(), options, fatal)
            .context("Failed to start controller thread")?
    else {
        tracing::error!("No application request from runner");
        terminate(1);
    };

    let result = run_application(&request);
    connection.report_result(result);
    drop(connection);

    if let Ok(Some(fatal)) = watcher.join() {
        terminate(fatal.exit_code());
    }
    tracing::info!(%result, "Worker finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_log_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("worker.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn open_log_file_appends() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.log");
        fs::write(&path, "first\n").unwrap();
        let mut file = open_log_file(&path).unwrap();
        file.write_all(b"second\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn open_log_file_reports_path_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_log_file(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains(&dir.path().display().to_string()));
    }

    #[test]
    fn application_reports_ok() {
        let request = ServiceRequest::new("app://echo".parse().unwrap());
        assert_eq!(run_application(&request), AppResult::Ok);
    }
}
