use std::fs;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DATA_DIR: &str = ".qgate";

/// Data directory: /app/data when the container volume exists, ~/.qgate otherwise.
pub fn get_data_dir() -> Result<PathBuf, String> {
    let volume = PathBuf::from("/app/data");
    let data_dir = if volume.exists() {
        volume
    } else {
        let home = dirs::home_dir().ok_or("Failed to get user home directory")?;
        home.join(DATA_DIR)
    };

    if !data_dir.exists() {
        fs::create_dir_all(&data_dir)
            .map_err(|e| format!("Failed to create data directory: {}", e))?;
    }

    Ok(data_dir)
}

pub fn get_log_dir() -> Result<PathBuf, String> {
    let log_dir = get_data_dir()?.join("logs");

    if !log_dir.exists() {
        fs::create_dir_all(&log_dir)
            .map_err(|e| format!("Failed to create log directory: {}", e))?;
    }

    Ok(log_dir)
}

/// Initialize logger system (console + daily rolling file).
pub fn init_logger() {
    let log_dir = match get_log_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to initialize log directory: {}", e);
            return;
        }
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "qgate.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    let file_layer = fmt::Layer::new()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_level(true);

    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    // The guard must outlive the process for the non-blocking writer to flush.
    std::mem::forget(guard);

    tracing::info!("Logger system initialized (console + file persistence)");
}
