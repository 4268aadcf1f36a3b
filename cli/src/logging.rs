use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::Subscriber;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. With a log directory, output goes to a
/// daily rolling file and the returned guard must outlive the program;
/// otherwise it goes to stderr.
pub fn init(log_dir: Option<&Path>) -> io::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(log_dir) = log_dir else {
        let subscriber = Subscriber::builder()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        return Ok(None);
    };

    fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "emudrop.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

    Ok(Some(guard))
}
