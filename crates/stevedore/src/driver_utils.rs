//! Driver construction from CLI context

use crate::cli::CliContext;
use anyhow::Result;
use stevedore_core::driver::{DriverFactory, DriverImpl};

/// Create a driver instance based on CLI context
pub fn create_driver_from_context(context: &CliContext) -> Result<DriverImpl> {
    let kind = DriverFactory::detect_driver(context.driver, &context.settings);
    Ok(DriverFactory::create_driver(kind, &context.settings)?)
}
