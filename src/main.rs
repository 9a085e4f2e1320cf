use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mailflow::config::MailflowConfig;
use mailflow::pipeline::Pipeline;
use mailflow::stages::{
    DelimitedExtractor, HttpDeliverer, ImapMailbox, StageSet, TemplateRenderer,
};
use mailflow::trigger::CronTrigger;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing: stdout plus a daily rolling file
    let log_dir = std::env::var("MAILFLOW_LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
    let file_appender = tracing_appender::rolling::daily(&log_dir, "mailflow.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(file_writer.and(std::io::stdout))
        .init();

    let config_path =
        std::env::var("MAILFLOW_CONFIG").unwrap_or_else(|_| "mailflow.json".to_string());
    let config = MailflowConfig::load(Path::new(&config_path))?;

    eprintln!("mailflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {}@{}", config.mailbox.username, config.mailbox.host);
    eprintln!("   Sink: {} {}", config.delivery.method, config.delivery.url);

    let stages = StageSet {
        mailbox: Arc::new(ImapMailbox::new(config.mailbox.clone())),
        extractor: Arc::new(DelimitedExtractor::new(config.extractor.clone())),
        renderer: Arc::new(TemplateRenderer::new(config.templater.clone())),
        deliverer: Arc::new(HttpDeliverer::new(config.delivery.clone())?),
    };

    let pipeline = Pipeline::new(config, Box::new(CronTrigger::new()), stages);
    let handle = pipeline.start().await?;
    info!("pipeline running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("stop requested");
    handle.stop();

    // The stop flag is observed before the next poll; give an in-flight
    // delivery a moment to finish, then exit regardless.
    if tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .is_err()
    {
        warn!("pipeline loop still busy after 5s; exiting anyway");
    }

    Ok(())
}
