use std::{
    io::{self, IsTerminal, Write},
    path::Path,
    time::{Duration, SystemTime},
};

use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::cli::ColorChoice;

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Installs the global subscriber: a console layer on stderr plus an optional
/// daily-rolling file layer under `<log_dir>/`. Worker threads are named
/// (`setup-1`, `llm-2`, ...) and the file layer records those names, which is
/// how log lines are attributed to a worker.
pub fn init_logging(
    verbosity: u8,
    color: ColorChoice,
    log_dir: Option<&Path>,
    command_name: &str,
) -> LogGuard {
    tracing_log::LogTracer::init().expect("Failed to set log tracer");

    let console_filter = match verbosity {
        0 => "info",
        1 => "info,librevue=debug",
        2 => "info,librevue=trace",
        _ => "trace",
    };

    let console_env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(console_filter));

    let use_ansi = match color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stderr().is_terminal(),
    };

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(use_ansi)
        .without_time()
        .with_target(false)
        .with_thread_names(true)
        .with_level(true)
        .with_filter(console_env_filter);

    let mut file_guard: Option<tracing_appender::non_blocking::WorkerGuard> = None;

    let file_layer = if let Some(dir) = log_dir {
        match std::fs::create_dir_all(dir) {
            Ok(()) => {
                compress_old_logs(dir, command_name);

                let file_appender = tracing_appender::rolling::Builder::new()
                    .rotation(tracing_appender::rolling::Rotation::DAILY)
                    .filename_prefix(command_name)
                    .filename_suffix("log")
                    .build(dir)
                    .expect("Failed to create rolling file appender");

                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                file_guard = Some(guard);

                let layer = fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_timer(UtcTime::rfc_3339())
                    .with_target(true)
                    .with_thread_names(true)
                    .with_level(true)
                    .with_filter(EnvFilter::new("debug"));

                Some(layer)
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not create log directory {}: {e}",
                    dir.display()
                );
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: file_guard,
    }
}

/// The daily appender only ever writes to today's file; anything older is
/// finished and safe to compress.
const COMPRESS_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Compressed logs past this age are discarded.
const DISCARD_AFTER: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Log-directory housekeeping: gzips this command's finished `.log` files
/// in place and drops `.log.gz` files past the retention window.
fn compress_old_logs(log_dir: &Path, command_name: &str) {
    let now = SystemTime::now();

    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };

        // Files with unreadable mtimes get age zero and are left alone.
        let age = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);

        if name.ends_with(".log.gz") {
            if age > DISCARD_AFTER {
                let _ = std::fs::remove_file(&path);
            }
        } else if name.starts_with(command_name) && name.ends_with(".log") && age > COMPRESS_AFTER {
            gzip_in_place(&path);
        }
    }
}

/// Replaces `path` with `path.gz`. The original is only removed once the
/// compressed copy is fully written; a half-written `.gz` is removed
/// instead.
fn gzip_in_place(path: &Path) {
    let gz_path = path.with_extension("log.gz");

    let result = std::fs::read(path).and_then(|contents| {
        let gz_file = std::fs::File::create(&gz_path)?;
        let mut encoder = flate2::write::GzEncoder::new(gz_file, flate2::Compression::default());
        encoder.write_all(&contents)?;
        encoder.finish()?;
        Ok(())
    });

    match result {
        Ok(()) => {
            let _ = std::fs::remove_file(path);
        }
        Err(_) => {
            let _ = std::fs::remove_file(&gz_path);
        }
    }
}
