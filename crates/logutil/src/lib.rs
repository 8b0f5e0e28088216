//! Utilities for logging.
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    HumanReadable,
    Json,
}

/// Install the global subscriber.
///
/// `RUST_LOG` directives take precedence over `default_level`. Installing a
/// second subscriber is a no-op.
pub fn configure_global_logger<W>(default_level: tracing::Level, format: LogFormat, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let env_filter = env_filter(default_level);
    match format {
        LogFormat::HumanReadable => set_global(
            FmtSubscriber::builder()
                .with_writer(writer)
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .finish(),
        ),
        LogFormat::Json => set_global(
            FmtSubscriber::builder()
                .json()
                .with_writer(writer)
                .with_env_filter(env_filter)
                .with_current_span(false)
                .finish(),
        ),
    }
}

/// Logger for tests, output is captured by the test harness.
pub fn init_test() {
    let _ = FmtSubscriber::builder()
        .with_test_writer()
        .with_env_filter(env_filter(tracing::Level::WARN))
        .with_file(true)
        .with_line_number(true)
        .try_init();
}

fn env_filter(default_level: tracing::Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy()
}

fn set_global<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set global logger: {e}");
    }
}
