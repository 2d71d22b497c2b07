use std::sync::Arc;
use std::time::Duration;

use clipcache_service::caching::CacheError;
use clipcache_service::types::ClipRequest;
use tokio::sync::Semaphore;

use crate::utils::{TestSynthesizer, audio_for, config, in_memory_service, service, setup, tempdir};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight() {
    setup();
    let dir = tempdir();
    let synthesizer =
        Arc::new(TestSynthesizer::new().with_delay(Duration::from_millis(200)));
    let service = Arc::new(service(dir.path(), synthesizer.clone()));

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.get_or_fetch("Hello World!", "en-US", false).await })
        })
        .collect();

    let expected = audio_for("Hello World!", "en-US");
    for task in tasks {
        let clip = task.await.unwrap().unwrap();
        assert_eq!(clip.audio, expected);
    }
    assert_eq!(synthesizer.calls(), 1);

    // all later requests are served from the store, including differently spelled ones
    let clip = service
        .get_or_fetch("  hello   world ", "en-US", false)
        .await
        .unwrap();
    assert!(clip.cached);
    assert_eq!(clip.audio, expected);
    assert_eq!(synthesizer.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_clips_do_not_coalesce() {
    let dir = tempdir();
    let synthesizer = Arc::new(TestSynthesizer::new().with_delay(Duration::from_millis(50)));
    let service = service(dir.path(), synthesizer.clone());

    let (hello, bonjour) = tokio::join!(
        service.get_or_fetch("hello", "en-US", false),
        service.get_or_fetch("hello", "fr-FR", false),
    );
    let (hello, bonjour) = (hello.unwrap(), bonjour.unwrap());

    assert_ne!(hello.key, bonjour.key);
    assert_ne!(hello.audio, bonjour.audio);
    assert_eq!(synthesizer.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_reaches_every_waiter() {
    setup();
    let dir = tempdir();
    let synthesizer = Arc::new(
        TestSynthesizer::new()
            .with_delay(Duration::from_millis(100))
            .failing_on("boom"),
    );
    let service = Arc::new(service(dir.path(), synthesizer.clone()));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.get_or_fetch("boom", "en-US", false).await })
        })
        .collect();

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
        match err {
            CacheError::Upstream(err) => assert_eq!(err.message(), r#"provider rejected "boom""#),
            other => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(synthesizer.calls(), 1);

    // failures are not cached, the next request tries again
    assert!(service.get_or_fetch("boom", "en-US", false).await.is_err());
    assert_eq!(synthesizer.calls(), 2);
    assert_eq!(service.get_stats().await.unwrap().total_clips, 0);
}

#[tokio::test]
async fn test_force_refresh() {
    let dir = tempdir();
    let synthesizer = Arc::new(TestSynthesizer::new());
    let service = service(dir.path(), synthesizer.clone());

    let first = service.get_or_fetch("Refresh me", "en-GB", false).await.unwrap();
    assert!(!first.cached);

    let cached = service.get_or_fetch("Refresh me", "en-GB", false).await.unwrap();
    assert!(cached.cached);
    assert_eq!(synthesizer.calls(), 1);

    let refreshed = service.get_or_fetch("Refresh me", "en-GB", true).await.unwrap();
    assert!(!refreshed.cached);
    assert_eq!(refreshed.key, first.key);
    assert_eq!(synthesizer.calls(), 2);

    service.flush_background().await;
    assert_eq!(service.get_stats().await.unwrap().total_clips, 1);
}

#[tokio::test]
async fn test_explicit_synthesizer() {
    let dir = tempdir();
    let configured = Arc::new(TestSynthesizer::new());
    let explicit = Arc::new(TestSynthesizer::new());
    let service = service(dir.path(), configured.clone());

    let clip = service
        .get_or_fetch_with("Use this one", "en-US", false, explicit.clone())
        .await
        .unwrap();
    assert!(!clip.cached);
    assert_eq!(explicit.calls(), 1);
    assert_eq!(configured.calls(), 0);

    let clip = service.get_or_fetch("Use this one", "en-US", false).await.unwrap();
    assert!(clip.cached);
    assert_eq!(configured.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bulk_preserves_order() {
    let dir = tempdir();
    let synthesizer = Arc::new(TestSynthesizer::new().with_delay(Duration::from_millis(20)));
    let service = service(dir.path(), synthesizer.clone());

    service.get_or_fetch("two", "en-US", false).await.unwrap();

    let requests = [
        ClipRequest::new("one", "en-US"),
        ClipRequest::new("two", "en-US"),
        ClipRequest::new("three", "de-DE"),
        ClipRequest::new("One!", "en-US"),
    ];
    let clips = service.bulk_get_or_fetch(&requests, false).await.unwrap();
    assert_eq!(clips.len(), requests.len());

    assert_eq!(clips[0].audio, audio_for("one", "en-US"));
    assert_eq!(clips[1].audio, audio_for("two", "en-US"));
    assert!(clips[1].cached);
    assert_eq!(clips[2].audio, audio_for("three", "de-DE"));
    assert!(!clips[2].cached);

    // "One!" and "one" are the same clip, requested in the same batch
    assert_eq!(clips[3].key, clips[0].key);
    assert_eq!(clips[3].audio, clips[0].audio);

    // "two" was cached, and "one" was synthesized once for both requests
    assert_eq!(synthesizer.calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bulk_is_all_or_nothing() {
    let dir = tempdir();
    let synthesizer = Arc::new(TestSynthesizer::new().failing_on("broken"));
    let service = service(dir.path(), synthesizer.clone());

    let requests = [
        ClipRequest::new("fine", "en-US"),
        ClipRequest::new("broken", "en-US"),
        ClipRequest::new("also fine", "en-US"),
    ];
    let err = service.bulk_get_or_fetch(&requests, false).await.unwrap_err();
    assert!(matches!(err, CacheError::Upstream(_)));

    // the failure of one request does not poison the others
    let clip = service.get_or_fetch("fine", "en-US", false).await.unwrap();
    assert_eq!(clip.audio, audio_for("fine", "en-US"));
}

#[tokio::test]
async fn test_empty_bulk() {
    let dir = tempdir();
    let synthesizer = Arc::new(TestSynthesizer::new());
    let service = service(dir.path(), synthesizer.clone());

    assert!(service.bulk_get_or_fetch(&[], false).await.unwrap().is_empty());
    assert_eq!(synthesizer.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_waiter_does_not_cancel_flight() {
    let gate = Arc::new(Semaphore::new(0));
    let synthesizer = Arc::new(TestSynthesizer::new().gated(gate.clone()));
    let service = Arc::new(in_memory_service(
        &config(std::path::Path::new(".")),
        synthesizer.clone(),
    ));

    let leader = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.get_or_fetch("patience", "en-US", false).await })
    };
    synthesizer.started().await;

    // a second caller gives up while the synthesis is still blocked
    let impatient = tokio::time::timeout(
        Duration::from_millis(50),
        service.get_or_fetch("patience", "en-US", false),
    )
    .await;
    assert!(impatient.is_err());

    gate.add_permits(1);
    let clip = leader.await.unwrap().unwrap();
    assert_eq!(clip.audio, audio_for("patience", "en-US"));
    assert_eq!(synthesizer.calls(), 1);

    let clip = service.get_or_fetch("patience", "en-US", false).await.unwrap();
    assert!(clip.cached);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_leader_does_not_cancel_flight() {
    let gate = Arc::new(Semaphore::new(0));
    let synthesizer = Arc::new(TestSynthesizer::new().gated(gate.clone()));
    let service = Arc::new(in_memory_service(
        &config(std::path::Path::new(".")),
        synthesizer.clone(),
    ));

    let leader = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.get_or_fetch("left early", "en-US", false).await })
    };
    synthesizer.started().await;

    let follower = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.get_or_fetch("left early", "en-US", false).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    leader.abort();
    gate.add_permits(1);

    let clip = follower.await.unwrap().unwrap();
    assert!(!clip.cached);
    assert_eq!(clip.audio, audio_for("left early", "en-US"));
    assert_eq!(synthesizer.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_synthesis_timeout() {
    let mut config = config(std::path::Path::new("."));
    config.fetch.synthesis_timeout = Duration::from_millis(50);

    // nobody ever opens the gate
    let gate = Arc::new(Semaphore::new(0));
    let synthesizer = Arc::new(TestSynthesizer::new().gated(gate));
    let service = in_memory_service(&config, synthesizer.clone());

    let (a, b) = tokio::join!(
        service.get_or_fetch("too slow", "en-US", false),
        service.get_or_fetch("too slow", "en-US", false),
    );
    for result in [a, b] {
        let err = result.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(d) if d == Duration::from_millis(50)));
        assert!(err.is_retryable());
    }
    assert_eq!(synthesizer.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_cancels_waiters() {
    setup();
    let gate = Arc::new(Semaphore::new(0));
    let synthesizer = Arc::new(TestSynthesizer::new().gated(gate));
    let service = Arc::new(in_memory_service(
        &config(std::path::Path::new(".")),
        synthesizer.clone(),
    ));

    let waiters: Vec<_> = (0..5)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.get_or_fetch("never", "en-US", false).await })
        })
        .collect();
    synthesizer.started().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    service.shutdown().await;

    for waiter in waiters {
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
    }
    assert_eq!(synthesizer.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nothing_is_synthesized_after_shutdown() {
    let dir = tempdir();
    let synthesizer = Arc::new(TestSynthesizer::new());
    let service = service(dir.path(), synthesizer.clone());

    let kept = service.get_or_fetch("Still here", "en-US", false).await.unwrap();
    service.shutdown().await;

    for i in 0..100 {
        let err = service
            .get_or_fetch(&format!("too late {i}"), "en-US", false)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Cancelled), "fetch {i}");
    }
    assert_eq!(synthesizer.calls(), 1);

    let clip = service.get_or_fetch("Still here", "en-US", false).await.unwrap();
    assert!(clip.cached);
    assert_eq!(clip.audio, kept.audio);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_caller_deadline() {
    let gate = Arc::new(Semaphore::new(0));
    let synthesizer = Arc::new(TestSynthesizer::new().gated(gate.clone()));
    let service = in_memory_service(&config(std::path::Path::new(".")), synthesizer.clone());

    let deadline = Duration::from_millis(50);
    let err = service
        .get_or_fetch_within("in a hurry", "en-US", false, deadline)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Timeout(d) if d == deadline));
    assert!(err.is_retryable());

    // the synthesis itself was not abandoned
    gate.add_permits(1);
    let clip = service.get_or_fetch("in a hurry", "en-US", false).await.unwrap();
    assert_eq!(clip.audio, audio_for("in a hurry", "en-US"));
    assert_eq!(synthesizer.calls(), 1);

    let clip = service
        .get_or_fetch_within("in a hurry", "en-US", false, deadline)
        .await
        .unwrap();
    assert!(clip.cached);
}
