use bulwark::config::LoggingConfig;
use tokio::signal;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Console plus optional daily-rolling file output. `RUST_LOG` wins over
/// `logging.level`. Keep the returned guard alive for the whole session.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},bulwark={}", config.level, config.level)));

    // rolling::daily panics when the first file cannot be created, so probe first
    let mut guard = None;
    let file_layer = config.directory.as_ref().and_then(|dir| {
        let probe = dir.join(".bulwark_write_test");
        let writable = std::fs::create_dir_all(dir).is_ok()
            && std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&probe)
                .is_ok();
        if !writable {
            eprintln!(
                "Warning: log directory {} is not writable, file logging disabled",
                dir.display()
            );
            return None;
        }
        let _ = std::fs::remove_file(&probe);

        let (writer, file_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "bulwark.log"));
        guard = Some(file_guard);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true);
        Some(if config.json { layer.json().boxed() } else { layer.boxed() })
    });

    let console_layer = if config.json {
        tracing_subscriber::fmt::layer().json().with_target(true).boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    guard
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
