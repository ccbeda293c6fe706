use std::process::ExitCode;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vnet_cni::cni::{Plugin, DEFAULT_RUNTIME_DIR};

fn main() -> ExitCode {
    // Stdout belongs to the CNI protocol; logs go to a rolling file.
    let _guard = setup_logging();

    if let Err(e) = std::fs::create_dir_all(DEFAULT_RUNTIME_DIR) {
        tracing::warn!(error = %e, "failed to create runtime directory");
    }

    let mut plugin = Plugin::new(DEFAULT_RUNTIME_DIR);
    match plugin.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn setup_logging() -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("/var/log/azure-vnet", "azure-vnet.log");
    let (nonblocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vnet_cni=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(nonblocking))
        .init();
    guard
}
