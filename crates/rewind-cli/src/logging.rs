//! Subscriber setup

use tracing_subscriber::{fmt, EnvFilter};

/// Install a stderr `fmt` subscriber; `RUST_LOG` overrides the verbosity flag
pub fn init(verbose: u8) {
    let directive = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let subscriber = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
