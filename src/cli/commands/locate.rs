//! CLI command implementation for `flashpipe locate`

use anyhow::Result;

use crate::cli::output::{create_spinner, status, OutputConfig};

use super::AppContext;

/// Execute the locate command
pub async fn execute(ctx: &AppContext, descriptor: &str) -> Result<()> {
    let output = OutputConfig::global();
    let spinner = output
        .show_progress()
        .then(|| create_spinner(&format!("Resolving {descriptor}")));

    let result = ctx.locator().resolve(descriptor).await;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let source = result?;

    if output.json {
        println!("{}", serde_json::to_string_pretty(&source)?);
        return Ok(());
    }

    println!("{} {}", status::SUCCESS, source.location);
    println!("  kind:        {}", serde_json::to_value(source.kind)?.as_str().unwrap_or("?"));
    println!("  file:        {}", source.resolved_filename);
    println!("  compression: {}", source.compression);
    if !source.traversal.is_empty() {
        println!("  traversed:   {}", source.traversal.join(" -> "));
    }
    Ok(())
}
