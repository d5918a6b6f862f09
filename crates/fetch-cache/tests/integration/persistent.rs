use std::time::Duration;

use fetch_cache::{PersistentStore, RequestInit};

use crate::utils::{setup_fetch, test};

#[tokio::test]
async fn test_survives_restart() {
    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let url = server.url("/hits/persisted");

    {
        let fetch = setup_fetch(PersistentStore::new(cache_dir.path()));
        let response = fetch
            .fetch(url.clone(), RequestInit::default())
            .await
            .unwrap()
            .unwrap();
        assert!(!response.from_cache());
        assert_eq!(response.size(), Some(1));
        assert_eq!(response.text().await.unwrap(), "1");
    }

    let fetch = setup_fetch(PersistentStore::new(cache_dir.path()));
    let response = fetch
        .fetch(url.clone(), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    assert!(response.from_cache());
    assert_eq!(response.status(), 200);
    assert_eq!(response.url(), url.as_str());
    assert_eq!(response.size(), Some(1));
    assert_eq!(response.text().await.unwrap(), "1");

    assert_eq!(server.accesses(), 1);
    assert!(cache_dir.path().join("content/sha256").is_dir());
    assert!(cache_dir.path().join("index").is_dir());
}

#[tokio::test]
async fn test_empty_body() {
    let cache_dir = test::tempdir();
    let fetch = setup_fetch(PersistentStore::new(cache_dir.path()));
    let server = test::HitCounter::new();
    let url = server.url("/empty/body");

    for from_cache in [false, true] {
        let response = fetch
            .fetch(url.clone(), RequestInit::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.from_cache(), from_cache);
        assert_eq!(response.status(), 200);
        assert!(response.bytes().await.unwrap().is_empty());
    }
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_expired_entries_are_refetched() {
    let cache_dir = test::tempdir();
    let fetch = setup_fetch(PersistentStore::with_ttl(
        cache_dir.path(),
        Duration::from_millis(200),
    ));
    let server = test::HitCounter::new();
    let url = server.url("/hits/expiring");

    let response = fetch
        .fetch(url.clone(), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "1");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let response = fetch
        .fetch(url.clone(), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    assert!(!response.from_cache());
    assert_eq!(response.text().await.unwrap(), "2");
}

#[tokio::test]
async fn test_evict_and_clear() {
    let cache_dir = test::tempdir();
    let store = PersistentStore::new(cache_dir.path().join("cache"));
    let fetch = setup_fetch(store.clone());
    let server = test::HitCounter::new();

    let response = fetch
        .fetch(server.url("/echo/evicted"), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    response.evict().await.unwrap();

    let response = fetch
        .fetch(server.url("/echo/evicted"), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    assert!(!response.from_cache());
    assert_eq!(server.accesses(), 2);

    store.clear().await.unwrap();
    let response = fetch
        .fetch(server.url("/echo/evicted"), RequestInit::default())
        .await
        .unwrap()
        .unwrap();
    assert!(!response.from_cache());
    assert_eq!(response.text().await.unwrap(), "evicted");
}
