use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;

use conduit_transfer::{
    FileSink, FileSource, ReceiverCoordinator, SenderCoordinator, TracingLogger, TransferConfig,
    TransferLogger, message_channel,
};
use conduit_types::TransferStats;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_host=info,conduit_transfer=info".into()),
        )
        .init();

    // Args
    let mut args = std::env::args().skip(1);
    let (Some(input), Some(output)) = (args.next(), args.next()) else {
        bail!("usage: conduit <input> <output>");
    };
    let input = PathBuf::from(input);
    let output = PathBuf::from(output);

    // Config
    let config = TransferConfig::from_env().context("invalid CONDUIT_* configuration")?;
    let repeat: u32 = match std::env::var("CONDUIT_REPEAT") {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("CONDUIT_REPEAT={:?} is not a number", value))?,
        Err(_) => 1,
    };
    let repeat = repeat.max(1);
    let logger: Arc<dyn TransferLogger> = Arc::new(TracingLogger);

    let (receiver_port, sender_port) = message_channel();

    // Sender context: answers one start signal per run. Dropping its port on
    // error ends the receiver's session with a closed channel.
    let sender = {
        let config = config.clone();
        let logger = Arc::clone(&logger);
        tokio::spawn(async move {
            let mut coordinator =
                SenderCoordinator::from_port(sender_port, config.clone()).with_logger(logger);
            for _ in 0..repeat {
                let source = FileSource::open(&input, config.chunk_size)
                    .await
                    .with_context(|| format!("cannot open {}", input.display()))?;
                info!(path = %input.display(), bytes = source.len(), "serving file");
                coordinator.serve(source).await?;
            }
            anyhow::Ok(())
        })
    };

    // Receiver context: initiates every run, reusing the channel.
    let sink = create_sink(&output).await?;
    let mut receiver = ReceiverCoordinator::from_port(receiver_port, sink, config).with_logger(logger);
    for run in 1..=repeat {
        if run > 1 {
            let sink = create_sink(&output).await?;
            receiver.reset(sink)?;
        }
        let stats = receiver
            .start_transfer()
            .await
            .with_context(|| format!("transfer {} of {} failed", run, repeat))?;
        report(run, &stats)?;
    }

    sender.await.context("sender task panicked")??;
    Ok(())
}

async fn create_sink(path: &Path) -> anyhow::Result<FileSink> {
    FileSink::create(path)
        .await
        .with_context(|| format!("cannot create {}", path.display()))
}

fn report(run: u32, stats: &TransferStats) -> anyhow::Result<()> {
    info!(
        run,
        bytes = stats.bytes_transferred,
        chunks = stats.chunks,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        kib_per_sec = stats.throughput_kib(),
        "transfer finished"
    );
    if stats.digest_verified == Some(false) {
        tracing::warn!(run, "received data does not match the sender's digest");
    }
    info!(stats = %serde_json::to_string(stats)?, "transfer stats");
    Ok(())
}
