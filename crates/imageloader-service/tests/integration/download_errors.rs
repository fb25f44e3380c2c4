use std::time::Duration;

use imageloader_service::error::{ImageError, TransportErrorKind};
use imageloader_service::types::LoadOptions;

use crate::{HitCounter, setup_manager};

fn transport_error_kind(result: Result<impl std::fmt::Debug, ImageError>) -> TransportErrorKind {
    match result {
        Err(ImageError::Transport(err)) => err.kind(),
        other => panic!("expected a transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_urls() {
    let (manager, _cache_dir) = setup_manager(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("respond_statuscode/404/missing.png");

    let result = manager.load(url.as_str(), LoadOptions::empty()).await;
    assert_eq!(
        transport_error_kind(result),
        TransportErrorKind::BadStatus(404)
    );
    assert!(manager.failed_urls().contains(&url));
    assert_eq!(hitcounter.accesses(), 1);

    // refused without touching the network
    let result = manager.load(url.as_str(), LoadOptions::empty()).await;
    assert_eq!(result.unwrap_err(), ImageError::Blacklisted);
    assert_eq!(hitcounter.accesses(), 0);

    let result = manager.load(url.as_str(), LoadOptions::RETRY_FAILED).await;
    assert_eq!(
        transport_error_kind(result),
        TransportErrorKind::BadStatus(404)
    );
    assert_eq!(hitcounter.accesses(), 1);
}

#[tokio::test]
async fn test_invalid_payloads() {
    let (manager, _cache_dir) = setup_manager(|_| {});
    let hitcounter = HitCounter::new();

    let url = hitcounter.url("garbage_data/not-an-image");
    let result = manager.load(url.as_str(), LoadOptions::empty()).await;
    assert_eq!(result.unwrap_err(), ImageError::DecodeFailure);
    assert!(manager.failed_urls().contains(&url));

    let url = hitcounter.url("empty/image.png");
    let result = manager.load(url.as_str(), LoadOptions::empty()).await;
    assert_eq!(transport_error_kind(result), TransportErrorKind::EmptyBody);
    assert!(manager.failed_urls().contains(&url));

    manager.cache().flush().await;
    assert_eq!(manager.cache().disk_count(), 0);
}

#[tokio::test]
async fn test_timeout() {
    let (manager, _cache_dir) = setup_manager(|config| {
        config.downloader.download_timeout = Duration::from_millis(100);
    });
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("delay/1h/image/1/1");

    let result = manager.load(url.as_str(), LoadOptions::empty()).await;
    assert_eq!(transport_error_kind(result), TransportErrorKind::TimedOut);

    // timeouts are transient, the next load tries again
    assert!(!manager.failed_urls().contains(&url));
    let result = manager.load(url.as_str(), LoadOptions::empty()).await;
    assert_eq!(transport_error_kind(result), TransportErrorKind::TimedOut);
    assert_eq!(hitcounter.accesses(), 2);
}

#[tokio::test]
async fn test_malformed_urls() {
    let (manager, _cache_dir) = setup_manager(|_| {});

    for url in ["", "   ", "not a url"] {
        let result = manager.load(url, LoadOptions::empty()).await;
        assert!(
            matches!(result, Err(ImageError::MalformedRequest(_))),
            "{url:?} must be refused"
        );
    }
    assert!(!manager.is_running());
}
