//! Batch entry point: `order-insight [config.toml]`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use order_insight::config::InsightConfig;
use order_insight::pipeline;
use order_insight::telemetry::init_tracing_from_env;

fn main() -> Result<()> {
    init_tracing_from_env();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = InsightConfig::load(config_path.as_deref())
        .context("Failed to load configuration")?;

    let summary = pipeline::run(&config).context("Order insight run failed")?;

    info!(
        run_id = %summary.run_id,
        appended = summary.appended,
        total_orders = summary.total_orders,
        report = %summary.report.display(),
        diagrams = summary.diagrams.len(),
        "done"
    );
    Ok(())
}
