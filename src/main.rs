use std::path::Path;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use image_manager::domain::entities::{CacheKey, ItemId};
use image_manager::infrastructure::{
    AppConfig, CliArgs, Command, DiskCache, DiskCacheConfig, StorageManager,
};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry().with(filter).init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let storage = match args.config.as_deref().and_then(Path::parent) {
        Some(dir) => StorageManager::with_dir(dir.to_path_buf()),
        None => StorageManager::new()?,
    };
    let mut config = storage
        .load_config(args.config.as_deref())
        .wrap_err("Failed to load configuration")?;
    config.merge_with_args(args);
    Ok(config)
}

async fn run(command: Command, cache: &DiskCache) -> Result<()> {
    match command {
        Command::Usage => {
            let capacity = match cache.capacity() {
                0 => "unlimited".to_string(),
                bytes => format!("{bytes} bytes"),
            };
            println!(
                "{}: {} entries, {} bytes used, capacity {capacity}",
                cache.cache_dir().display(),
                cache.len(),
                cache.current_usage(),
            );
        }
        Command::Sweep => {
            let purged = cache.sweep_expired().await;
            println!("Purged {purged} expired entries");
        }
        Command::Clear => {
            cache.remove_all().await?;
            println!("Cleared {}", cache.cache_dir().display());
        }
        Command::RemoveSince { since } => {
            let removed = cache.remove_since(since).await;
            println!("Removed {removed} entries written since {}", since.to_rfc3339());
        }
        Command::Remove {
            item,
            format: Some(format),
        } => {
            let key = CacheKey::new(item, format);
            let existed = cache.entry(&key).is_ok();
            cache.remove(&key).await;
            println!("Removed {}", u8::from(existed));
        }
        Command::Remove { item, format: None } => {
            let removed = cache.remove_all_for_item(&ItemId::new(item)).await;
            println!("Removed {removed}");
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

    info!(version = image_manager::VERSION, command = ?args.command, "Starting image-manager");

    let cache_config = DiskCacheConfig {
        sweep_interval: None,
        ..DiskCacheConfig::from(&config.images)
    };
    let cache = DiskCache::open(config.manager_cache_dir(), cache_config)
        .await
        .wrap_err("Failed to open disk cache")?;

    run(args.command, &cache).await
}
