use std::sync::Arc;
use std::time::Duration;

use fetch_cache::{MemoryStore, RequestInit, get_cache_key};

use crate::utils::{setup_fetch, test};

#[tokio::test]
async fn test_second_fetch_is_cached() {
    let fetch = setup_fetch(MemoryStore::new());
    let server = test::HitCounter::new();
    let url = server.url("/hits/a");

    let first = fetch
        .fetch(url.clone(), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    assert!(!first.from_cache());
    assert_eq!(first.status(), 200);
    assert_eq!(first.url(), url.as_str());
    assert_eq!(first.text().await.unwrap(), "1");

    let second = fetch
        .fetch(url.clone(), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    assert!(second.from_cache());
    assert_eq!(second.header("content-type"), Some("text/plain; charset=utf-8"));
    assert_eq!(second.text().await.unwrap(), "1");

    assert_eq!(server.accesses(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetches_share_one_request() {
    let fetch = Arc::new(setup_fetch(MemoryStore::new()));
    let server = test::HitCounter::new();
    let url = server.url("/delay/100ms/slow");

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let fetch = Arc::clone(&fetch);
            let url = url.clone();
            tokio::spawn(async move {
                let response = fetch
                    .fetch(url, RequestInit::default())
                    .await
                    .unwrap()
                    .unwrap();
                let from_cache = response.from_cache();
                (from_cache, response.text().await.unwrap())
            })
        })
        .collect();

    let mut from_network = 0;
    for task in tasks {
        let (from_cache, body) = task.await.unwrap();
        assert_eq!(body, "slow");
        if !from_cache {
            from_network += 1;
        }
    }

    assert_eq!(from_network, 1);
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_ttl_expiry() {
    let fetch = setup_fetch(MemoryStore::with_ttl(Duration::from_millis(300)));
    let server = test::HitCounter::new();
    let url = server.url("/hits/ttl");

    for expected in ["1", "1"] {
        let response = fetch
            .fetch(url.clone(), RequestInit::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.text().await.unwrap(), expected);
    }

    tokio::time::sleep(Duration::from_millis(400)).await;

    let response = fetch
        .fetch(url.clone(), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    assert!(!response.from_cache());
    assert_eq!(response.text().await.unwrap(), "2");
}

#[tokio::test]
async fn test_only_if_cached() {
    let fetch = setup_fetch(MemoryStore::new());
    let server = test::HitCounter::new();
    let url = server.url("/echo/cached");
    let only_if_cached = || RequestInit::default().header("Cache-Control", "only-if-cached");

    let missed = fetch.fetch(url.clone(), only_if_cached()).await.unwrap();
    assert!(missed.is_none());
    assert_eq!(server.accesses(), 0);

    fetch
        .fetch(url.clone(), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.accesses(), 1);

    let hit = fetch
        .fetch(url.clone(), only_if_cached())
        .await
        .unwrap()
        .unwrap();
    assert!(hit.from_cache());
    assert_eq!(hit.text().await.unwrap(), "cached");
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_evict() {
    let fetch = setup_fetch(MemoryStore::new());
    let server = test::HitCounter::new();
    let url = server.url("/hits/evict");

    let response = fetch
        .fetch(url.clone(), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    let key = response.key().clone();
    assert_eq!(key, get_cache_key(&url.clone().into(), &RequestInit::default()).unwrap());
    response.evict().await.unwrap();
    assert!(fetch.store().get(&key).await.unwrap().is_none());

    let response = fetch
        .fetch(url.clone(), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    assert!(!response.from_cache());
    assert_eq!(response.text().await.unwrap(), "2");
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_error_statuses_are_cached() {
    let fetch = setup_fetch(MemoryStore::new());
    let server = test::HitCounter::new();
    let url = server.url("/respond_statuscode/503/x");

    for from_cache in [false, true] {
        let response = fetch
            .fetch(url.clone(), RequestInit::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.from_cache(), from_cache);
        assert_eq!(response.status(), 503);
        assert_eq!(response.status_text(), "Service Unavailable");
        assert!(!response.ok());
    }
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_request_fields_partition_the_cache() {
    let fetch = setup_fetch(MemoryStore::new());
    let server = test::HitCounter::new();
    let url = server.url("/inspect/partition");

    for accept in ["text/plain", "application/json", "text/plain"] {
        let init = RequestInit::default().header("Accept", accept);
        fetch.fetch(url.clone(), init).await.unwrap().unwrap();
    }
    assert_eq!(server.accesses(), 2);

    // transport options never change the key
    let mut init = RequestInit::default().header("Accept", "text/plain");
    init.transport.timeout = Some(Duration::from_secs(3));
    let response = fetch.fetch(url.clone(), init).await.unwrap().unwrap();
    assert!(response.from_cache());
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_transport_error_is_not_cached() {
    let fetch = setup_fetch(MemoryStore::new());

    // nothing listens on the discard port
    for _ in 0..2 {
        let err = fetch
            .fetch("http://127.0.0.1:9/", RequestInit::default())
            .await
            .unwrap_err();
        assert!(matches!(err, fetch_cache::FetchError::Transport(_)));
    }
}
