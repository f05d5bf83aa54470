//! Engine connectivity probe

use crate::cli::CliContext;
use crate::driver_utils::create_driver_from_context;
use anyhow::{Context, Result};
use std::process::ExitCode;
use stevedore_core::driver::Driver;
use tracing::instrument;

#[instrument(skip_all)]
pub async fn execute(context: &CliContext) -> Result<ExitCode> {
    let mut driver = create_driver_from_context(context)?;
    let version = driver
        .server_version()
        .await
        .with_context(|| format!("Container engine is unreachable through the {} driver", driver.kind()))?;
    println!("{} driver: engine {}", driver.kind(), version);
    driver.close().await?;
    Ok(ExitCode::SUCCESS)
}
