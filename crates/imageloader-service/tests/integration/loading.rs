use std::time::Duration;

use imageloader_service::types::{CacheSource, LoadOptions};

use crate::{HitCounter, load_with_receiver, manager_for, settle, setup_manager, test_config};

#[tokio::test]
async fn test_download_and_cache() {
    let (manager, cache_dir) = setup_manager(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("image/4/4").to_string();

    let loaded = manager.load(&url, LoadOptions::empty()).await.unwrap();
    assert!(loaded.finished);
    assert_eq!(loaded.source, CacheSource::None);
    assert_eq!((loaded.image.width(), loaded.image.height()), (4, 4));
    assert_eq!(
        loaded.data.as_deref(),
        Some(&imageloader_test::raw_image(4, 4)[..])
    );
    assert_eq!(hitcounter.accesses(), 1);

    let loaded = manager.load(&url, LoadOptions::empty()).await.unwrap();
    assert_eq!(loaded.source, CacheSource::Memory);
    assert_eq!(loaded.data, None);
    assert_eq!(hitcounter.accesses(), 0);

    // the disk write happens in the background
    manager.cache().flush().await;
    assert_eq!(manager.cache().disk_count(), 1);

    // a fresh manager only shares the disk tier
    let manager = manager_for(&test_config(cache_dir.path()));
    let loaded = manager.load(&url, LoadOptions::empty()).await.unwrap();
    assert_eq!(loaded.source, CacheSource::Disk);
    assert_eq!((loaded.image.width(), loaded.image.height()), (4, 4));
    assert_eq!(hitcounter.accesses(), 0);
}

#[tokio::test]
async fn test_memory_only() {
    let (manager, _cache_dir) = setup_manager(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("image/2/2");

    let loaded = manager
        .load(url.as_str(), LoadOptions::CACHE_MEMORY_ONLY)
        .await
        .unwrap();
    assert_eq!(loaded.source, CacheSource::None);

    manager.cache().flush().await;
    assert_eq!(manager.cache().disk_count(), 0);
    assert!(manager.cached_image_exists(&url));
    assert!(!manager.disk_image_exists(&url));
}

#[tokio::test]
async fn test_corrupt_cache_file() {
    let (manager, _cache_dir) = setup_manager(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("image/2/2");

    let mut corrupt = vec![0xff; 8];
    corrupt.push(0);
    manager.cache().disk().write(url.as_str(), &corrupt).unwrap();

    let loaded = tokio::time::timeout(
        Duration::from_secs(5),
        manager.load(url.as_str(), LoadOptions::empty()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(loaded.source, CacheSource::None);
    assert_eq!((loaded.image.width(), loaded.image.height()), (2, 2));
    assert_eq!(hitcounter.accesses(), 1);
    assert!(!manager.is_running());

    // the download replaced the corrupt file
    manager.cache().flush().await;
    assert_eq!(
        manager.cache().disk().read(url.as_str()).unwrap().as_deref(),
        Some(&imageloader_test::raw_image(2, 2)[..])
    );
}

#[tokio::test]
async fn test_coalescing() {
    let (manager, _cache_dir) = setup_manager(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("image/8/8").to_string();

    // hold the downloads back until every load has registered
    manager.downloader().set_suspended(true);
    let resume = async {
        settle(&manager).await;
        assert_eq!(manager.downloader().current_download_count(), 1);
        manager.downloader().set_suspended(false);
    };

    let (first, second, third, ()) = futures::join!(
        manager.load(&url, LoadOptions::empty()),
        manager.load(&url, LoadOptions::empty()),
        manager.load(&url, LoadOptions::HIGH_PRIORITY),
        resume,
    );

    let first = first.unwrap();
    assert_eq!(first.image, second.unwrap().image);
    assert_eq!(first.image, third.unwrap().image);
    assert_eq!(hitcounter.accesses(), 1);
}

#[tokio::test]
async fn test_refresh_cached() {
    let (manager, _cache_dir) = setup_manager(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("image/2/2").to_string();

    manager.load(&url, LoadOptions::empty()).await.unwrap();
    assert_eq!(hitcounter.accesses(), 1);

    let mut receiver = load_with_receiver(&manager, &url, LoadOptions::REFRESH_CACHED);

    let cached = receiver.recv().await.unwrap().unwrap();
    assert!(!cached.finished);
    assert_eq!(cached.source, CacheSource::Memory);

    let refreshed = receiver.recv().await.unwrap().unwrap();
    assert!(refreshed.finished);
    assert_eq!(refreshed.source, CacheSource::None);
    assert_eq!(refreshed.image, cached.image);
    assert_eq!(hitcounter.accesses(), 1);
}

#[tokio::test]
async fn test_progressive() {
    let (manager, _cache_dir) = setup_manager(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("chunked/4/4/20ms").to_string();

    let mut receiver = load_with_receiver(&manager, &url, LoadOptions::PROGRESSIVE);

    let mut partial_heights = Vec::new();
    let finished = loop {
        let loaded = receiver.recv().await.unwrap().unwrap();
        if loaded.finished {
            break loaded;
        }
        assert_eq!(loaded.source, CacheSource::None);
        partial_heights.push(loaded.image.height());
    };

    assert_eq!((finished.image.width(), finished.image.height()), (4, 4));
    // chunks may be merged on their way, but never grow out of order
    assert!(!partial_heights.is_empty());
    assert!(partial_heights.windows(2).all(|w| w[0] <= w[1]));
    assert!(partial_heights.iter().all(|&height| height < 4));
}

#[tokio::test]
async fn test_cancel_on_drop() {
    let (manager, _cache_dir) = setup_manager(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("delay/1h/image/1/1").to_string();

    let load = manager.load(&url, LoadOptions::empty());
    assert!(
        tokio::time::timeout(Duration::from_millis(100), load)
            .await
            .is_err()
    );

    assert!(!manager.is_running());
    assert_eq!(manager.downloader().current_download_count(), 0);
}
