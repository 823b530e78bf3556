//! `cordon check`: simulate a load and report every class

use std::path::Path;
use tracing::info;

/// Returns whether every class would load
pub fn execute(blob: &Path, config: Option<&Path>, profile: Option<&str>) -> anyhow::Result<bool> {
    let bytes = super::read_blob(blob)?;
    let report = super::builder(config, profile)?.validate(&bytes)?;
    print!("{}", report);

    let failed = report.errors().count();
    info!(classes = report.classes.len(), failed, "validation finished");
    if failed == 0 {
        println!("ok: {} classes", report.classes.len());
    } else {
        println!("{} of {} classes rejected", failed, report.classes.len());
    }
    Ok(report.is_ok())
}
