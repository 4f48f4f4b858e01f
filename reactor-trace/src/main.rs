use clap::Parser;
use reactor_trace::config::{self, Cli, Config};
use reactor_trace::{observability, pipeline, report};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env before resolving config so REACTOR_TRACE_* values in it apply.
    // Logging depends on the resolved config, so the outcome is logged afterwards.
    let env_file = config::load_env_file();
    let config = Config::resolve(&cli)?;
    observability::init(config.log_format)?;
    env_file.log();

    tracing::info!(
        schema = %config.schema.display(),
        trace = %config.trace.display(),
        config_file = ?config.config_file,
        "Starting reactor trace processing"
    );

    let processed = match pipeline::run(&config).await {
        Ok(processed) => processed,
        Err(err) => {
            tracing::error!(error = %err, "Trace processing failed");
            return Err(err.into());
        }
    };

    let report = report::build(processed);
    report::write(&report, config.output.as_deref(), config.pretty)?;
    report::log_summary(&report);
    Ok(())
}
