//! # Composite Controller
//!
//! Watches `CompositeController` objects and runs one parent/child
//! reconciliation engine per object.

use anyhow::Result;
use composite_controller::runtime::initialization::initialize;
use composite_controller::runtime::watch_loop::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    let init_result = initialize().await?;

    run_watch_loop(init_result.client, init_result.supervisor).await?;

    Ok(())
}
