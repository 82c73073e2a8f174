mod cli;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use std::sync::Arc;
use tls_preflight::engine::ConnectivityTester;
use tls_preflight::input::load_targets;
use tls_preflight::output::ReportWriter;
use tls_preflight::OpensslConnectionFactory;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = cli.into_config()?;

    if let Some(path) = cfg.input.as_deref() {
        let targets = load_targets(path)
            .await
            .with_context(|| format!("failed to load targets from {path}"))?;
        cfg.targets.extend(targets);
    }
    if cfg.targets.is_empty() {
        anyhow::bail!("no targets to test");
    }

    let tester = ConnectivityTester::new(Arc::new(OpensslConnectionFactory), cfg.settings.clone());
    let report = tester
        .test_target_strings(cfg.targets, &cfg.options, cfg.max_concurrency)
        .await;

    let mut writer = ReportWriter::stdout(cfg.output);
    writer.write_report(&report)?;

    Ok(())
}
