//! `cordon dump`: show the raw wire tree

use cordon_bytecode::Encoded;
use std::path::Path;

pub fn execute(blob: &Path, compact: bool) -> anyhow::Result<()> {
    let bytes = super::read_blob(blob)?;
    let tree = Encoded::decode(&bytes)?;
    let json = if compact {
        serde_json::to_string(&tree)?
    } else {
        serde_json::to_string_pretty(&tree)?
    };
    println!("{}", json);
    Ok(())
}
