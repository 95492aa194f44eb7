use anyhow::Context;
use rask_event_forwarder::app::{App, Config, setup_logging_safe};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args(std::env::args_os()).context("failed to load configuration")?;
    setup_logging_safe(config.log_level, config.log_format)
        .context("failed to initialize logging")?;

    let app = App::from_config(config).context("failed to start the pipeline")?;
    app.run().await.context("pipeline shutdown failed")?;
    Ok(())
}
