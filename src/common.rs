//! Basic functions used by several other modules.

use anyhow::{Context, Result};
use signal_hook::consts::SIGINT;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

/// Exit code used when a second interrupt forces an immediate abort.
pub const EXIT_FORCED_ABORT: i32 = 5;

static STOP: LazyLock<Arc<AtomicBool>> = LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Whether a graceful stop was requested. Checked between repositories
/// only; a half-written record would corrupt resume.
pub fn stop_requested() -> bool {
    STOP.load(Ordering::Relaxed)
}

/// Install the SIGINT handling: the first interrupt raises the stop flag,
/// a second one exits immediately with [`EXIT_FORCED_ABORT`].
///
/// The conditional shutdown is registered first so it observes the flag
/// value from before the current signal delivery.
pub fn install_stop_handler() -> Result<()> {
    signal_hook::flag::register_conditional_shutdown(SIGINT, EXIT_FORCED_ABORT, Arc::clone(&STOP))
        .context("registering forced-abort handler")?;
    signal_hook::flag::register(SIGINT, Arc::clone(&STOP))
        .context("registering stop handler")?;
    Ok(())
}
