//! Subcommand implementations and the setup they share

pub mod check;
pub mod dump;
pub mod run;

use anyhow::Context;
use cordon_core::{AllowAll, Sandbox, SandboxBuilder, SandboxConfig, ShimTable};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Read a program blob
pub fn read_blob(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Builder configured from an optional config file and profile
pub fn builder(config: Option<&Path>, profile: Option<&str>) -> anyhow::Result<SandboxBuilder> {
    let config = match config {
        Some(path) => SandboxConfig::from_file(path).with_context(|| format!("invalid config {}", path.display()))?,
        None => SandboxConfig::default(),
    };

    let builder = match profile {
        Some(name) => Sandbox::builder(config.policy(name)?),
        None => {
            warn!("no profile given; every type is allowed");
            Sandbox::builder_with(Arc::new(AllowAll))
        }
    };
    Ok(builder
        .shims(ShimTable::standard(&config.component_types))
        .options(config.sandbox))
}
