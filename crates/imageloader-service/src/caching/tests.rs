use std::sync::Mutex;

use crate::types::RawCodec;

use super::*;

fn image(width: u32, fill: u8) -> Image {
    Image::new(width, 1, vec![fill; width as usize * 4])
}

fn cache_with_config(config: &Config) -> ImageCache {
    let runtime = Handle::current();
    ImageCache::from_config(
        config,
        Arc::new(RawCodec),
        Delivery::serial(&runtime),
        &runtime,
    )
    .unwrap()
}

fn new_cache(cache_dir: Option<&Path>) -> ImageCache {
    cache_with_config(&Config {
        cache_dir: cache_dir.map(Path::to_path_buf),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_memory_hit_precedes_disk() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let cache = new_cache(Some(tempdir.path()));

    // a different payload on disk must never be consulted on a memory hit
    let on_disk = RawCodec.encode(&image(2, 1)).unwrap();
    cache.disk().write("key", &on_disk).unwrap();
    cache.store("key", image(3, 2), None, false);

    let (found, source) = cache.lookup("key").await;
    assert_eq!(source, CacheSource::Memory);
    assert_eq!(found, Some(image(3, 2)));
}

#[tokio::test]
async fn test_disk_hit_is_promoted() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let cache = new_cache(Some(tempdir.path()));

    cache.store("key", image(4, 7), None, true);
    cache.flush().await;
    cache.clear_memory();
    assert_eq!(cache.get("key"), None);

    let (found, source) = cache.lookup("key").await;
    assert_eq!(source, CacheSource::Disk);
    assert_eq!(found, Some(image(4, 7)));

    // the disk hit now lives in memory
    assert_eq!(cache.get("key"), Some(image(4, 7)));
}

#[tokio::test]
async fn test_miss() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let cache = new_cache(Some(tempdir.path()));

    assert_eq!(cache.lookup("missing").await, (None, CacheSource::None));
    assert_eq!(cache.get_or_load("missing"), None);

    let cache = new_cache(None);
    assert_eq!(cache.lookup("missing").await, (None, CacheSource::None));
}

#[tokio::test]
async fn test_get_or_load() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let cache = new_cache(Some(tempdir.path()));

    let data = RawCodec.encode(&image(2, 3)).unwrap();
    cache.disk().write("key", &data).unwrap();

    assert_eq!(cache.get("key"), None);
    assert_eq!(cache.get_or_load("key"), Some(image(2, 3)));
    assert!(cache.exists_in_memory("key"));
}

#[tokio::test]
async fn test_corrupt_file_is_a_miss() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let cache = new_cache(Some(tempdir.path()));

    cache.disk().write("key", b"not an image").unwrap();
    assert_eq!(cache.lookup("key").await, (None, CacheSource::None));

    let mut huge = vec![0xff; 8];
    huge.push(0);
    cache.disk().write("huge", &huge).unwrap();
    assert_eq!(cache.lookup("huge").await, (None, CacheSource::None));
}

#[derive(Debug)]
struct PanickingCodec;

impl ImageCodec for PanickingCodec {
    fn decode(&self, _data: &[u8]) -> Option<Image> {
        panic!("broken codec");
    }
}

#[tokio::test]
async fn test_panicking_codec_is_a_miss() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let runtime = Handle::current();
    let config = Config {
        cache_dir: Some(tempdir.path().to_path_buf()),
        ..Default::default()
    };
    let cache = ImageCache::from_config(
        &config,
        Arc::new(PanickingCodec),
        Delivery::serial(&runtime),
        &runtime,
    )
    .unwrap();

    cache.disk().write("key", b"payload").unwrap();
    assert_eq!(cache.lookup("key").await, (None, CacheSource::None));

    // the I/O queue survives the panic
    cache.disk().write("other", b"payload").unwrap();
    assert_eq!(cache.lookup("other").await, (None, CacheSource::None));
}

#[tokio::test]
async fn test_store_keeps_original_data() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let cache = new_cache(Some(tempdir.path()));

    cache.store("key", image(1, 0), Some(Bytes::from_static(b"original")), true);
    cache.flush().await;

    assert_eq!(
        cache.disk().read("key").unwrap(),
        Some(Bytes::from_static(b"original"))
    );
}

#[tokio::test]
async fn test_cancelled_query() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let cache = new_cache(Some(tempdir.path()));

    cache.store("key", image(1, 0), None, true);
    cache.flush().await;
    cache.clear_memory();

    let called = Arc::new(Mutex::new(false));
    let query = {
        let called = called.clone();
        cache.query("key", move |_, _| *called.lock().unwrap() = true)
    };
    query.cancel();
    assert!(query.is_cancelled());

    cache.flush().await;
    cache.delivery().flush().await;
    assert!(!*called.lock().unwrap());

    // memory hits are suppressed just the same
    cache.store("key", image(1, 0), None, false);
    let query = {
        let called = called.clone();
        cache.query("key", move |_, _| *called.lock().unwrap() = true)
    };
    query.cancel();
    cache.delivery().flush().await;
    assert!(!*called.lock().unwrap());
}

#[tokio::test]
async fn test_remove_and_clear() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let cache = new_cache(Some(tempdir.path()));

    cache.store("a", image(1, 0), None, true);
    cache.store("b", image(1, 0), None, true);
    cache.flush().await;
    assert_eq!(cache.disk_count(), 2);

    cache.remove("a", false);
    assert!(!cache.exists_in_memory("a"));
    assert!(cache.exists_on_disk("a"));

    cache.remove("a", true);
    cache.flush().await;
    assert!(!cache.exists_on_disk("a"));

    cache.clear_disk();
    cache.flush().await;
    assert_eq!(cache.disk_count(), 0);
    assert_eq!(cache.disk_size(), 0);
    // memory is unaffected by clearing the disk
    assert!(cache.exists_in_memory("b"));

    cache.on_memory_warning();
    assert!(cache.memory().is_empty());
}

#[tokio::test]
async fn test_async_disk_queries() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let cache = new_cache(Some(tempdir.path()));

    cache.store("key", image(2, 0), None, true);

    let (sender, receiver) = oneshot::channel();
    cache.exists_on_disk_async("key", move |exists| {
        sender.send(exists).ok();
    });
    assert!(receiver.await.unwrap());

    let (sender, receiver) = oneshot::channel();
    cache.calculate_size(move |count, size| {
        sender.send((count, size)).ok();
    });
    // header plus two pixels
    assert_eq!(receiver.await.unwrap(), (1, 16));
}

#[tokio::test]
async fn test_memory_disabled() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let mut config = Config {
        cache_dir: Some(tempdir.path().to_path_buf()),
        ..Default::default()
    };
    config.caches.memory.enabled = false;
    let cache = cache_with_config(&config);

    cache.store("key", image(1, 0), None, true);
    cache.flush().await;
    assert_eq!(cache.get("key"), None);

    let (found, source) = cache.lookup("key").await;
    assert_eq!(source, CacheSource::Disk);
    assert!(found.is_some());
    assert!(cache.memory().is_empty());

    cache.set_should_cache_in_memory(true);
    cache.store("key", image(1, 0), None, false);
    assert!(cache.get("key").is_some());
}

#[tokio::test]
async fn test_read_only_cache_path() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let seed = imageloader_test::tempdir();
    let cache = new_cache(Some(tempdir.path()));

    let path = cache.cache_path_for_key("seeded", seed.path());
    std::fs::write(&path, RawCodec.encode(&image(1, 9)).unwrap()).unwrap();
    assert_ne!(cache.default_cache_path_for_key("seeded"), Some(path));

    cache.add_read_only_cache_path(seed.path());
    let (found, source) = cache.lookup("seeded").await;
    assert_eq!(source, CacheSource::Disk);
    assert_eq!(found, Some(image(1, 9)));
}

#[tokio::test]
async fn test_clean_expired() {
    imageloader_test::setup();
    let tempdir = imageloader_test::tempdir();
    let mut config = Config {
        cache_dir: Some(tempdir.path().to_path_buf()),
        ..Default::default()
    };
    config.caches.disk.max_size = Some(20);
    let cache = cache_with_config(&config);

    for i in 0..4 {
        // 12 bytes each
        cache.store(&format!("image-{i}"), image(1, i), None, true);
    }
    cache.flush().await;
    assert_eq!(cache.disk_size(), 48);

    cache.clean_expired();
    cache.flush().await;
    assert!(cache.disk_size() <= 20);
}
