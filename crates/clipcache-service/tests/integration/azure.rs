use std::sync::Arc;

use clipcache_service::caching::CacheError;
use clipcache_service::config::AzureConfig;
use clipcache_service::services::{AzureSynthesizer, ClipService};
use clipcache_test::{SUBSCRIPTION_KEY, SYNTHESIS_PATH, SpeechServer, VOICES_PATH};

use crate::utils::{config, setup, tempdir};

fn azure_config(server: &SpeechServer) -> AzureConfig {
    let yaml = format!(
        "subscription_key: {SUBSCRIPTION_KEY}\nregion: westeurope\nendpoint: {}\nmax_qps: 100\n",
        server.endpoint()
    );
    serde_yaml::from_str(&yaml).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clips_are_synthesized_once() {
    setup();
    let dir = tempdir();
    let server = SpeechServer::new();
    let synthesizer = Arc::new(AzureSynthesizer::new(&azure_config(&server)).unwrap());
    let service = Arc::new(ClipService::create(&config(dir.path()), synthesizer).unwrap());

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.get_or_fetch("Good morning!", "en-GB", false).await })
        })
        .collect();

    let mut clips = Vec::new();
    for task in tasks {
        clips.push(task.await.unwrap().unwrap());
    }
    assert!(clips.iter().all(|clip| clip.audio == clips[0].audio));
    assert!(clips[0].audio.starts_with(b"ID3"));

    // en-GB has no voice of its own and falls back to the english default
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].ssml.contains("name='en-US-JennyNeural'"));
    assert!(requests[0].ssml.contains(">Good morning!<"));

    let clip = service.get_or_fetch("good morning", "en-GB", false).await.unwrap();
    assert!(clip.cached);
    assert_eq!(server.hits(SYNTHESIS_PATH), 1);
    assert_eq!(server.hits(VOICES_PATH), 1);
}

#[tokio::test]
async fn test_service_errors_are_retryable() {
    let dir = tempdir();
    let server = SpeechServer::new();
    let synthesizer = Arc::new(AzureSynthesizer::new(&azure_config(&server)).unwrap());
    let service = ClipService::create(&config(dir.path()), synthesizer).unwrap();

    let err = service.get_or_fetch("FAIL", "en-US", false).await.unwrap_err();
    assert!(matches!(err, CacheError::Upstream(_)), "{err:?}");
    assert!(err.is_retryable());

    let err = service.get_or_fetch("hello", "ja-JP", false).await.unwrap_err();
    assert!(
        err.to_string()
            .contains("no voice available for language code: ja-JP"),
        "{err}"
    );

    let lookup = service.get_cached_only("FAIL", "en-US").await.unwrap();
    assert_eq!(lookup.audio, None);
}
