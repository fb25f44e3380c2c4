//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use imageloader_service::caching::{CleanupStats, ImageCache};
use imageloader_service::config::Config;
use imageloader_service::delivery::Delivery;
use imageloader_service::manager::{ImageManager, LoadedImage};
use imageloader_service::metrics;
use imageloader_service::types::{ImageCodec, LoadOptions, OpaqueCodec, RawCodec};

use crate::logging;

/// How downloaded payloads are interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum Codec {
    /// Keep payloads as they are.
    #[default]
    Opaque,
    /// Uncompressed RGBA with a width and height header.
    Raw,
}

impl Codec {
    fn build(self) -> Arc<dyn ImageCodec> {
        match self {
            Codec::Opaque => Arc::new(OpaqueCodec),
            Codec::Raw => Arc::new(RawCodec),
        }
    }
}

/// Image loader commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load images through the cache, downloading them when missing.
    Fetch {
        /// The URLs of the images.
        #[arg(required = true)]
        urls: Vec<String>,

        /// How to decode the downloaded payloads.
        #[arg(long, value_enum, default_value_t)]
        codec: Codec,

        /// Download again even if the image is cached.
        #[arg(long)]
        refresh: bool,

        /// Do not write downloaded images to the disk cache.
        #[arg(long)]
        memory_only: bool,
    },

    /// Remove expired files from the disk cache.
    Cleanup,

    /// Remove all files from the disk cache.
    Clear,

    /// Print the number of files and the size of the disk cache.
    Size,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "imageloader", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: No other threads exist yet, the runtime is created below.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("imageloader")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    match cli.command {
        Command::Fetch {
            urls,
            codec,
            refresh,
            memory_only,
        } => {
            let mut options = LoadOptions::empty();
            options.set(LoadOptions::REFRESH_CACHED, refresh);
            options.set(LoadOptions::CACHE_MEMORY_ONLY, memory_only);
            runtime.block_on(fetch(&config, codec, urls, options))?
        }
        Command::Cleanup => {
            let cache = open_cache(&config, &runtime)?;
            let stats = cache
                .disk()
                .cleanup()
                .context("failed to clean up the cache")?;
            println!("{}", format_cleanup(&stats));
        }
        Command::Clear => {
            let cache = open_cache(&config, &runtime)?;
            cache.clear_disk();
            runtime.block_on(cache.flush());
            tracing::info!("Cleared the disk cache");
        }
        Command::Size => {
            let cache = open_cache(&config, &runtime)?;
            println!("{} files, {} bytes", cache.disk_count(), cache.disk_size());
        }
    }

    Ok(())
}

fn open_cache(config: &Config, runtime: &tokio::runtime::Runtime) -> Result<ImageCache> {
    let handle = runtime.handle();
    ImageCache::from_config(
        config,
        Arc::new(OpaqueCodec),
        Delivery::serial(handle),
        handle,
    )
    .context("failed to open the cache")
}

async fn fetch(
    config: &Config,
    codec: Codec,
    urls: Vec<String>,
    options: LoadOptions,
) -> Result<()> {
    let runtime = tokio::runtime::Handle::current();
    let manager = ImageManager::from_config(config, codec.build(), runtime)
        .context("failed to create the image manager")?;

    let mut failed = 0;
    for url in urls {
        let start = Instant::now();
        match manager.load(&url, options).await {
            Ok(loaded) => {
                println!("{}", format_loaded(&loaded));
                tracing::debug!(%url, elapsed = ?start.elapsed(), "Loaded image");
            }
            Err(err) => {
                failed += 1;
                println!("{url}: {err}");
            }
        }
    }

    // downloaded images are written to disk in the background
    manager.cache().flush().await;

    if failed > 0 {
        anyhow::bail!("failed to load {failed} image(s)");
    }
    Ok(())
}

fn format_loaded(loaded: &LoadedImage) -> String {
    let image = &loaded.image;
    format!(
        "{}: {}x{} ({} bytes) from {}",
        loaded.url,
        image.width(),
        image.height(),
        image.pixels().len(),
        loaded.source,
    )
}

fn format_cleanup(stats: &CleanupStats) -> String {
    format!(
        "removed {} files ({} bytes), retained {} files ({} bytes)",
        stats.removed_files, stats.removed_bytes, stats.retained_files, stats.retained_bytes
    )
}

#[cfg(test)]
mod tests {
    use imageloader_service::types::{CacheSource, Image};

    use super::*;

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from([
            "imageloader",
            "fetch",
            "--codec",
            "raw",
            "--refresh",
            "https://example.com/a.png",
            "https://example.com/b.png",
        ])
        .unwrap();

        let Command::Fetch {
            urls,
            codec,
            refresh,
            memory_only,
        } = cli.command
        else {
            panic!("expected the fetch command");
        };
        assert_eq!(urls.len(), 2);
        assert_eq!(codec, Codec::Raw);
        assert!(refresh);
        assert!(!memory_only);
        assert_eq!(cli.config, None);
    }

    #[test]
    fn test_parse_global_config() {
        let cli = Cli::try_parse_from(["imageloader", "size", "--config", "config.yml"]).unwrap();
        assert_eq!(cli.config(), Some(Path::new("config.yml")));
        assert!(matches!(cli.command, Command::Size));

        assert!(Cli::try_parse_from(["imageloader", "fetch"]).is_err());
    }

    #[test]
    fn test_format_loaded() {
        let loaded = LoadedImage {
            image: Image::new(2, 3, vec![0; 24]),
            data: None,
            source: CacheSource::Disk,
            finished: true,
            url: "https://example.com/a.png".parse().unwrap(),
        };
        insta::assert_snapshot!(
            format_loaded(&loaded),
            @"https://example.com/a.png: 2x3 (24 bytes) from disk"
        );
    }

    #[test]
    fn test_format_cleanup() {
        let stats = CleanupStats {
            removed_files: 2,
            removed_bytes: 2048,
            retained_files: 1,
            retained_bytes: 512,
        };
        insta::assert_snapshot!(
            format_cleanup(&stats),
            @"removed 2 files (2048 bytes), retained 1 files (512 bytes)"
        );
    }
}
