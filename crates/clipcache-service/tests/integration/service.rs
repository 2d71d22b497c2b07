use std::sync::Arc;

use clipcache_service::caching::{CacheError, Compression, Store};

use crate::utils::{
    TestSynthesizer, audio_for, config, service, service_with, setup, sized_audio_for, tempdir,
};

#[tokio::test]
async fn test_delete() {
    let dir = tempdir();
    let synthesizer = Arc::new(TestSynthesizer::new());
    let service = service(dir.path(), synthesizer.clone());

    let outcome = service.delete("Not there", "en-US").await.unwrap();
    assert!(!outcome.deleted);

    let clip = service.get_or_fetch("Delete me.", "en-US", false).await.unwrap();
    let outcome = service.delete("delete me", "en-US").await.unwrap();
    assert!(outcome.deleted);
    assert_eq!(outcome.key, clip.key);

    let lookup = service.get_cached_only("Delete me.", "en-US").await.unwrap();
    assert_eq!(lookup.audio, None);
    assert_eq!(lookup.key, clip.key);

    // deleting twice is fine
    assert!(!service.delete("Delete me.", "en-US").await.unwrap().deleted);

    // the next fetch synthesizes again
    let clip = service.get_or_fetch("Delete me.", "en-US", false).await.unwrap();
    assert!(!clip.cached);
    assert_eq!(synthesizer.calls(), 2);
}

#[tokio::test]
async fn test_stats_accounting() {
    let dir = tempdir();
    let synthesizer = Arc::new(TestSynthesizer::new());
    let service = service(dir.path(), synthesizer);

    let stats = service.get_stats().await.unwrap();
    assert_eq!(stats.total_clips, 0);
    assert_eq!(stats.total_size, 0);
    assert_eq!(stats.max_size_mb, None);

    for (text, language) in [
        ("one", "en-US"),
        ("two", "en-US"),
        ("eins", "de-DE"),
        ("zwei", "de-DE"),
        ("drei", "de-DE"),
    ] {
        service.get_or_fetch(text, language, false).await.unwrap();
    }
    service.delete("two", "en-US").await.unwrap();
    service.delete("drei", "de-DE").await.unwrap();
    service.delete("never stored", "de-DE").await.unwrap();
    service.flush_background().await;

    let stats = service.get_stats().await.unwrap();
    assert_eq!(stats.total_clips, 3);
    assert_eq!(stats.total_size, 3 * 4096);
    assert_eq!(stats.compressed_clips, 0);
    assert_eq!(stats.languages["de-DE"].clips, 2);
    assert_eq!(stats.languages["en-US"].bytes, 4096);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["total_clips"], 3);
    assert!(json.get("usage_percent").is_none());
}

#[tokio::test]
async fn test_compression_enabled_mid_run() {
    setup();
    let dir = tempdir();
    let synthesizer = Arc::new(TestSynthesizer::new());
    let expected = audio_for("Welcome back", "en-US");

    let mut config = config(dir.path());
    {
        let service = service_with(config.clone(), synthesizer.clone());
        service.get_or_fetch("Welcome back", "en-US", false).await.unwrap();
        service.flush_background().await;
        assert_eq!(service.get_stats().await.unwrap().compressed_clips, 0);
    }

    config.database.compression = true;
    let service = service_with(config, synthesizer.clone());

    let lookup = service.get_cached_only("Welcome back", "en-US").await.unwrap();
    assert_eq!(lookup.audio.as_ref(), Some(&expected));
    service.flush_background().await;

    let stats = service.get_stats().await.unwrap();
    assert_eq!(stats.compressed_clips, 1);

    let store = Store::open(&dir.path().join("cache.db")).unwrap();
    let entry = store.get(&lookup.key).unwrap().unwrap();
    assert_eq!(entry.compression, Compression::Zstd);

    let clip = service.get_or_fetch("Welcome back", "en-US", false).await.unwrap();
    assert!(clip.cached);
    assert_eq!(clip.audio, expected);
    assert_eq!(synthesizer.calls(), 1);
}

#[tokio::test]
async fn test_clips_survive_restart() {
    let dir = tempdir();
    let synthesizer = Arc::new(TestSynthesizer::new());
    {
        let service = service(dir.path(), synthesizer.clone());
        service.get_or_fetch("Persistent", "en-US", false).await.unwrap();
        service.flush_background().await;
    }

    let service = service(dir.path(), synthesizer.clone());
    let clip = service.get_or_fetch("persistent", "en-US", false).await.unwrap();
    assert!(clip.cached);
    assert_eq!(synthesizer.calls(), 1);
}

#[tokio::test]
async fn test_budget_is_enforced() {
    let dir = tempdir();
    let mut config = config(dir.path());
    config.database.max_size_mb = Some(1);
    let synthesizer = Arc::new(TestSynthesizer::new().with_audio_len(200_000));
    let service = service_with(config, synthesizer);

    for i in 0..10 {
        service
            .get_or_fetch(&format!("paragraph {i}"), "en-US", false)
            .await
            .unwrap();
        service.flush_background().await;

        let stats = service.get_stats().await.unwrap();
        assert!(stats.total_size <= 1024 * 1024, "after fetch {i}");
        assert!(stats.usage_percent.unwrap() <= 100.0);
    }

    let stats = service.get_stats().await.unwrap();
    assert_eq!(stats.total_clips, 5);
    assert_eq!(stats.max_size_mb, Some(1.0));

    for i in 0..10 {
        let text = format!("paragraph {i}");
        let lookup = service.get_cached_only(&text, "en-US").await.unwrap();
        let expected = (i >= 5).then(|| sized_audio_for(&text, "en-US", 200_000));
        assert_eq!(lookup.audio, expected, "paragraph {i}");
    }

    let outcome = service.evict_now().await.unwrap();
    assert_eq!(outcome.evicted_clips, 0);
}

#[tokio::test]
async fn test_store_write_failure_still_returns_audio() {
    setup();
    let dir = tempdir();
    let synthesizer = Arc::new(TestSynthesizer::new());
    let service = service(dir.path(), synthesizer.clone());

    // pull the table out from under the service
    let conn = rusqlite::Connection::open(dir.path().join("cache.db")).unwrap();
    conn.execute_batch("DROP TABLE audio_cache;").unwrap();

    let clip = service
        .get_or_fetch("Unstorable", "en-US", true)
        .await
        .unwrap();
    assert!(!clip.cached);
    assert_eq!(clip.audio, audio_for("Unstorable", "en-US"));

    // reading is on the request path, so that failure does surface
    let err = service
        .get_or_fetch("Unstorable", "en-US", false)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
    assert!(!err.is_retryable());
    assert!(matches!(service.get_stats().await, Err(CacheError::Store(_))));
}
