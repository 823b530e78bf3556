//! `cordon run`: load a blob and invoke a static method

use cordon_core::Value;
use std::path::Path;
use tracing::info;

pub fn execute(
    blob: &Path,
    class: &str,
    method: &str,
    config: Option<&Path>,
    profile: Option<&str>,
    args: &[String],
) -> anyhow::Result<()> {
    let bytes = super::read_blob(blob)?;
    let sandbox = super::builder(config, profile)?.load(&bytes)?;
    let args = args.iter().map(|a| parse_arg(a)).collect();

    let result = sandbox.invoke_static(class, method, args)?;
    let stats = sandbox.stats();
    info!(
        instructions = stats.instructions,
        elapsed = ?stats.total_elapsed,
        "{}::{} finished",
        class,
        method
    );
    match result {
        Some(value) => println!("{}", value),
        None => println!("(void)"),
    }
    Ok(())
}

fn parse_arg(arg: &str) -> Value {
    if let Ok(v) = arg.parse::<i32>() {
        return Value::I32(v);
    }
    if let Ok(v) = arg.parse::<i64>() {
        return Value::I64(v);
    }
    match arg {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    match arg.parse::<f64>() {
        Ok(v) if arg.contains('.') => Value::F64(v),
        _ => Value::string(arg),
    }
}
