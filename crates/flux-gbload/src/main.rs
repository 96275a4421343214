use anyhow::Context;
use clap::Parser;
use flux_gbload::{LoadConfig, LoadTester, PlatformClient};
use flux_shutdown::{ShutdownLatch, SignalHandler};
use std::{sync::Arc, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "GB28181 platform concurrent live-pull load tester")]
struct Args {
    /// 平台根地址
    #[arg(long, default_value = "http://127.0.0.1:9000")]
    base_url: String,

    /// 访问令牌
    #[arg(long)]
    token: String,

    /// 每设备通道上限（0 为不限）
    #[arg(long, default_value_t = 0)]
    per_device_limit: usize,

    /// 每路播放时长（秒）
    #[arg(long, default_value_t = 300)]
    duration: u64,

    #[arg(short = 'c', long, default_value_t = 20)]
    concurrency: usize,

    /// HTTP 超时（秒）
    #[arg(long, default_value_t = 30.0)]
    timeout: f64,

    /// 失败的通道不再重试
    #[arg(long)]
    no_retry: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    anyhow::ensure!(!args.token.trim().is_empty(), "--token must not be empty");
    let timeout = Duration::try_from_secs_f64(args.timeout)
        .context("--timeout must be a non-negative number of seconds")?;

    let client = PlatformClient::new(args.base_url.as_str(), args.token.trim(), timeout)
        .context("Failed to build HTTP client")?;
    let config = LoadConfig {
        per_device_limit: args.per_device_limit,
        play_duration: Duration::from_secs(args.duration),
        concurrency: args.concurrency,
        retry_failed: !args.no_retry,
        ..LoadConfig::default()
    };

    let latch = Arc::new(ShutdownLatch::new());
    let signals = SignalHandler::new(latch.clone());
    tokio::spawn(async move {
        if let Err(e) = signals.listen().await {
            tracing::error!(target: "gbload", error = %e, "Failed to install signal handlers");
        }
    });

    let tester = LoadTester::new(client, config).with_shutdown(latch);
    let report = tester
        .run()
        .await
        .with_context(|| format!("Failed to query devices from {}", args.base_url))?;

    tracing::info!(
        target: "gbload",
        targets = report.targets,
        failed = report.failed.len(),
        still_failed = report.still_failed.len(),
        total_mb = report.total_bytes as f64 / (1024.0 * 1024.0),
        "All streams finished in {:.2}s",
        report.elapsed.as_secs_f64()
    );
    for target in &report.still_failed {
        tracing::warn!(target: "gbload", stream = %target, "Stream failed after retry");
    }
    Ok(())
}
