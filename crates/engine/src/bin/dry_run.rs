//! Plan an import without touching the destination.
//!
//! Reads `IDMIGRATE_*` from the environment, forces dry-run mode, runs the
//! job over the JSON-lines input and prints the summary as JSON. Ctrl-C
//! aborts and leaves the checkpoint resumable.

use anyhow::Context;
use idmigrate_core::InMemoryIdentityApi;
use idmigrate_engine::{Coordinator, ImportConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    idmigrate_observability::init();

    let config = ImportConfig::from_env()
        .context("invalid IDMIGRATE_* configuration")?
        .with_dry_run(true);
    tracing::info!(input = %config.input_path.display(), workers = config.workers, "starting dry run");

    // Dry runs never call the API; the in-memory one only satisfies the type.
    let coordinator = Coordinator::new(config, InMemoryIdentityApi::arc());
    let abort = coordinator.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, aborting");
            abort.cancel();
        }
    });

    let summary = coordinator.run().await.context("dry run failed")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
