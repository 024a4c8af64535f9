use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr, eyre};
use image::DynamicImage;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use viewcache::application::MaxAgeInstructions;
use viewcache::domain::entities::ResourceSlot;
use viewcache::infrastructure::{
    AppConfig, BitmapInstructions, BitmapSpec, CacheContext, ChannelDispatcher, CliArgs, Command,
    ConfigFile, HttpJsonSource, UiLoop, check_slots,
};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));
    let registry = tracing_subscriber::registry().with(filter);

    let Some(log_path) = config.effective_log_path() else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
        return Ok(());
    };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .wrap_err_with(|| format!("cannot open log file {}", log_path.display()))?;

    registry
        .with(fmt::layer().with_writer(file).with_ansi(false))
        .init();
    info!(path = %log_path.display(), "Logging to file");
    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let mut config = ConfigFile::locate(args.config.as_deref())?.load()?;
    config.merge_with_args(args);
    check_slots(&config)?;
    Ok(config)
}

type Bitmaps = BitmapInstructions<ResourceSlot<DynamicImage>>;

async fn show_images(
    ctx: &CacheContext,
    ui: &mut UiLoop,
    urls: Vec<String>,
    spec: BitmapSpec,
) -> Result<()> {
    let downloader = ctx.image_downloader::<Bitmaps>()?;
    let finished = Arc::new(AtomicUsize::new(0));
    let instructions = Arc::new({
        let finished = finished.clone();
        Bitmaps::new().on_bound(move |_, uid, success| {
            if !success {
                warn!(uid = uid.unwrap_or_default(), "Image unavailable");
            }
            finished.fetch_add(1, Ordering::SeqCst);
        })
    });

    let targets: Vec<_> = urls
        .into_iter()
        .map(|url| (url, Arc::new(ResourceSlot::new())))
        .collect();
    for (url, target) in &targets {
        downloader.get(
            Some(target.clone()),
            Some(url.clone()),
            spec,
            instructions.clone(),
        );
    }

    let deadline = Duration::from_secs(ctx.config().downloader.timeout_secs * 2 + 5);
    let wait = async {
        while finished.load(Ordering::SeqCst) < targets.len() {
            if !ui.run_next().await {
                break;
            }
        }
    };
    if tokio::time::timeout(deadline, wait).await.is_err() {
        warn!("Timed out waiting for images");
    }

    for (url, target) in &targets {
        match target.resource() {
            Some(image) => println!("{url}: {}x{}", image.width(), image.height()),
            None => println!("{url}: unavailable"),
        }
    }
    println!("{}", downloader.stats());
    Ok(())
}

async fn run(ctx: &CacheContext, ui: &mut UiLoop, command: Command) -> Result<()> {
    match command {
        Command::Fetch { url, slot, max_age } => {
            let downloader = &ctx.config().downloader;
            let source = Arc::new(HttpJsonSource::<serde_json::Value>::new(
                &downloader.user_agent,
                Duration::from_secs(downloader.timeout_secs),
            )?);
            let cacher = ctx.cacher(source, slot).await?;

            let value = match max_age {
                Some(secs) => cacher
                    .get_value_with(&MaxAgeInstructions::from_secs(secs), &url)
                    .await
                    .wrap_err_with(|| format!("failed to fetch {url}"))?,
                None => cacher
                    .get_value(&url)
                    .await
                    .ok_or_else(|| eyre!("{url} is neither reachable nor cached"))?,
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Image {
            urls,
            max_width,
            max_height,
        } => {
            let spec = BitmapSpec {
                max_width,
                max_height,
            };
            show_images(ctx, ui, urls, spec).await?;
        }
        Command::Keys { slot } => {
            for key in ctx.persistence(slot).await?.list_keys().await? {
                println!("{key}");
            }
        }
        Command::Cleanup { slot } => {
            let removed = ctx.persistence(slot).await?.run_cleanup_policy().await?;
            println!("removed {removed} entries");
        }
        Command::Clear { slot } => {
            ctx.persistence(slot).await?.clear().await?;
            println!("slot {slot} cleared");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = viewcache::VERSION, "Starting viewcache");

    let (dispatcher, mut ui) = ChannelDispatcher::new();
    let ctx = CacheContext::init(config, Arc::new(dispatcher));

    let result = run(&ctx, &mut ui, args.command).await;

    ctx.shutdown().await;

    result
}
