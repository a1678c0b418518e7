use eyre::{
    Context as _,
    Result,
};
use meshcall_config::get_data_dir;
use std::sync::Arc;
use tracing_subscriber::{
    fmt,
    prelude::*,
    EnvFilter,
};

lazy_static::lazy_static! {
    static ref LOG_FILE: String = format!("{}.log", env!("CARGO_PKG_NAME"));
    static ref LOG_ENV: String = format!("{}_LOG", env!("CARGO_PKG_NAME").to_uppercase());
}

fn file_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV.as_str())
        .unwrap_or_else(|_| EnvFilter::new("info,meshcall=debug,meshcall_session=debug"))
}

/// Logs to stderr, filtered by `RUST_LOG`, and to a log file in the data directory, filtered by `MESHCALL_LOG`.
pub fn init_logging() -> Result<()> {
    let directory = get_data_dir();
    std::fs::create_dir_all(&directory).context("Failed to create data directory")?;
    let log_path = directory.join(LOG_FILE.as_str());
    let log_file = std::fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
        )
        .with(
            fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false)
                .with_filter(file_filter()),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    debug!(path = %log_path.display(), "logging initialized");
    Ok(())
}
