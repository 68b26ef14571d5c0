use anyhow::Result;
use tracing::Level;
use tracing_subscriber::fmt;

/// One-shot CLI runs stay silent unless `verbose`. The server always logs.
pub fn init(verbose: bool, serving: bool) -> Result<()> {
    let level = match (verbose, serving) {
        (true, _) => Level::DEBUG,
        (false, true) => Level::INFO,
        (false, false) => return Ok(()),
    };
    let _ = fmt()
        .with_max_level(level)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
    Ok(())
}
