pub mod terrain;

pub use terrain::*;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Installs a stdout `tracing` subscriber as the process-wide default.
///
/// Fails if another subscriber has been installed already.
pub fn init_logging(level: Level) -> Result<()> {
    // a builder for `FmtSubscriber`.
    let subscriber = FmtSubscriber::builder()
        // events at `level` and above are written to stdout.
        .with_max_level(level)
        // completes the builder.
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Logging(e.to_string()))?;
    info!("logging initialised at {}", level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_subscriber_is_rejected() {
        let _ = init_logging(Level::DEBUG);
        let err = init_logging(Level::DEBUG).unwrap_err();
        assert!(matches!(err, Error::Logging(_)));
    }
}
