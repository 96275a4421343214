use anyhow::{anyhow, Context};
use clap::Parser;
use flux_gbsim::{ConfigLoader, DevicePool, FfmpegSource, MediaSource, NullSource, SimulatorConfig};
use flux_shutdown::{ShutdownLatch, SignalHandler};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "GB28181 device simulator")]
struct Args {
    /// TOML 配置文件（不存在时使用默认值）
    #[arg(short, long, default_value = "./config/gbsim.toml")]
    config: PathBuf,

    #[arg(long)]
    platform_ip: Option<String>,

    #[arg(long)]
    platform_port: Option<u16>,

    /// 模拟设备数量
    #[arg(short = 'n', long)]
    count: Option<usize>,

    #[arg(long)]
    channels: Option<usize>,

    #[arg(long)]
    base_port: Option<u16>,

    #[arg(long)]
    local_ip: Option<String>,

    /// 只建中继不推流
    #[arg(long)]
    no_media: bool,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// 打印最终生效的配置后退出
    #[arg(long)]
    dump_config: bool,
}

impl Args {
    fn apply(&self, config: &mut SimulatorConfig) {
        if let Some(ip) = &self.platform_ip {
            config.platform.ip = ip.clone();
        }
        if let Some(port) = self.platform_port {
            config.platform.port = port;
        }
        if let Some(count) = self.count {
            config.fleet.count = count;
        }
        if let Some(channels) = self.channels {
            config.fleet.channels_per_device = channels;
        }
        if let Some(port) = self.base_port {
            config.fleet.base_port = port;
        }
        if let Some(ip) = &self.local_ip {
            config.fleet.local_ip = Some(ip.clone());
        }
        if self.no_media {
            config.media.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG 优先于 --log-level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = ConfigLoader::new(Some(&args.config))
        .load()
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    args.apply(&mut config);
    config.validate().map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    if args.dump_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let media: Arc<dyn MediaSource> = if config.media.enabled {
        let source = FfmpegSource::new(config.media.clone());
        let files = source.collect_files();
        if files.is_empty() {
            tracing::warn!(target: "gbsimd", "No .mp4 files found, relays will start without a feed");
        } else {
            tracing::info!(target: "gbsimd", files = files.len(), "Media files found");
        }
        Arc::new(source)
    } else {
        Arc::new(NullSource)
    };

    tracing::info!(
        target: "gbsimd",
        platform = %format!("{}:{}", config.platform.ip, config.platform.port),
        devices = config.fleet.count,
        channels = config.fleet.channels_per_device,
        base_port = config.fleet.base_port,
        "Starting GB28181 device simulator"
    );

    let pool = Arc::new(
        DevicePool::new(config.device_configs(), media)
            .with_start_stagger(Duration::from_millis(config.fleet.start_stagger_ms)),
    );

    let latch = Arc::new(ShutdownLatch::new());
    let signals = SignalHandler::new(latch.clone());
    tokio::spawn(async move {
        if let Err(e) = signals.listen().await {
            tracing::error!(target: "gbsimd", error = %e, "Failed to install signal handlers");
        }
    });

    let stats_task = (config.timing.stats_interval_secs > 0).then(|| {
        let pool = pool.clone();
        let period = Duration::from_secs(config.timing.stats_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = pool.stats();
                tracing::info!(
                    target: "gbsim::pool",
                    registered = stats.registered,
                    devices = stats.devices,
                    relays = stats.active_relays,
                    total_bytes = stats.total_bytes,
                    "Bandwidth {:.3} MB/s",
                    stats.megabytes_per_second()
                );
            }
        })
    });

    tokio::select! {
        _ = pool.start() => {}
        _ = latch.wait() => {}
    }
    latch.wait().await;

    if let Some(task) = stats_task {
        task.abort();
    }
    pool.shutdown().await;
    tracing::info!(target: "gbsimd", "Simulator stopped");
    Ok(())
}
