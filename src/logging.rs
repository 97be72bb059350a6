//! Structured logging setup
//!
//! Logs go to stderr so that stage output on stdout stays readable.
//! `RUST_LOG` or `SUPPORT_QA_LOG` override the verbosity flags.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing from CLI verbosity (`-v` count) and format flag
pub fn init_tracing(verbose: u8, log_json: bool) -> anyhow::Result<()> {
    let level = match verbose {
        0 => "support_qa=info",
        1 => "support_qa=debug",
        _ => "support_qa=trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("SUPPORT_QA_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    if log_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    Ok(())
}
