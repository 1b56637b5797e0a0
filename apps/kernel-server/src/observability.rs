// [[MISSION]]/apps/kernel-server/src/observability.rs
// Purpose: Tracing subscriber setup for the kernel process.
// Architecture: Application Boot
// Dependencies: tracing-subscriber

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins; the kernel and the HTTP layer get verbose defaults.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("mission_kernel=debug".parse()?)
        .add_directive("tower_http=trace".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing already initialized: {}", e))?;
    Ok(())
}
