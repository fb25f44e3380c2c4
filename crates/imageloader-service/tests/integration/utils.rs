use std::path::Path;
use std::sync::Arc;

use imageloader_service::config::Config;
use imageloader_service::error::ImageError;
use imageloader_service::manager::{ImageManager, LoadedImage};
use imageloader_service::types::RawCodec;
use imageloader_test as test;
use tokio::sync::mpsc;

pub use test::{HitCounter, TempDir};

/// The outcome of a single delivery to a completion.
pub type Outcome = Result<LoadedImage, ImageError>;

/// Creates a configuration caching to `cache_dir`.
pub fn test_config(cache_dir: &Path) -> Config {
    Config {
        cache_dir: Some(cache_dir.to_owned()),
        ..Default::default()
    }
}

/// Setup tests and create a test manager.
///
/// This function returns a tuple containing the manager to test, and a temporary cache
/// directory. The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as
/// guard until the test has finished.
///
/// The `update_config` closure can modify any default configuration if needed before the manager
/// is created.
pub fn setup_manager(update_config: impl FnOnce(&mut Config)) -> (ImageManager, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let mut config = test_config(cache_dir.path());
    update_config(&mut config);

    (manager_for(&config), cache_dir)
}

/// Creates a manager decoding [`RawCodec`] payloads downloaded over HTTP.
pub fn manager_for(config: &Config) -> ImageManager {
    let runtime = tokio::runtime::Handle::current();
    ImageManager::from_config(config, Arc::new(RawCodec), runtime).unwrap()
}

/// Loads `url`, sending every delivery to the returned receiver.
pub fn load_with_receiver(
    manager: &ImageManager,
    url: &str,
    options: imageloader_service::types::LoadOptions,
) -> mpsc::UnboundedReceiver<Outcome> {
    let (sender, receiver) = mpsc::unbounded_channel();
    // requests keep running when their handle is dropped
    let _request = manager.load_image(
        url,
        options,
        None,
        Arc::new(move |outcome: Outcome| {
            sender.send(outcome).ok();
        }),
    );
    receiver
}

/// Waits until all scheduled cache work and deliveries have run.
pub async fn settle(manager: &ImageManager) {
    manager.cache().flush().await;
    manager.cache().delivery().flush().await;
}
