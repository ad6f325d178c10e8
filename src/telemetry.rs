//! Tracing setup for binaries and tests

use tracing::Level;

/// Install a global fmt subscriber at the given level.
///
/// Returns false if a global subscriber was already set, so it is safe to
/// call from several tests.
pub fn init_tracing(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}
