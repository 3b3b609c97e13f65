use std::env;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Set up tracing with an ANSI stdout layer and a plain file layer.
/// Level comes from `DOWNSWEEP_LOG` (default `info`), file path from
/// `DOWNSWEEP_LOG_FILE` (default `./logs/downsweep.log`).
pub fn init_logger() -> impl Drop {
    let filter = env::var("DOWNSWEEP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_layer = EnvFilter::new(filter);

    let log_file_path =
        env::var("DOWNSWEEP_LOG_FILE").unwrap_or_else(|_| "./logs/downsweep.log".to_string());

    let file_appender = tracing_appender::rolling::never("./", log_file_path);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_file(false)
                .without_time()
                .with_ansi(true),
        )
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(filter_layer)
        .init();

    guard
}
