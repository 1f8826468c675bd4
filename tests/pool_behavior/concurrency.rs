// ABOUTME: Behavioral tests for the per-destination concurrency bound and permit accounting

use std::time::Duration;

use crate::fixtures::{config, dispatcher, key, wait_until, ScriptedConnector};
use overlay_https::pool::ConnectionPoolRegistry;
use overlay_https::request::{HttpsRequest, RequestEvent};

/// A third request against a pool of two waits until one of the first two releases
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_third_request_blocks_until_release() {
    let connector = ScriptedConnector::new();
    let gate = connector.gate();
    let dispatcher = dispatcher(&connector, &config(2));

    let mut first = dispatcher.submit(HttpsRequest::new("https://svcA/1")).unwrap();
    let mut second = dispatcher.submit(HttpsRequest::new("https://svcA/2")).unwrap();
    assert!(matches!(first.events.recv().await, Some(RequestEvent::Ready { .. })));
    assert!(matches!(second.events.recv().await, Some(RequestEvent::Ready { .. })));

    let mut third = dispatcher.submit(HttpsRequest::new("https://svcA/3")).unwrap();
    let waited = tokio::time::timeout(Duration::from_millis(150), third.events.recv()).await;
    assert!(waited.is_err(), "Third request must not get a client while both are busy");
    assert_eq!(dispatcher.registry().stats(&key("svca")).unwrap().available_permits, 0);

    // Let exactly one of the first two finish
    gate.add_permits(1);

    let ready = tokio::time::timeout(Duration::from_secs(2), third.events.recv())
        .await
        .expect("third request should acquire after a release");
    assert!(matches!(ready, Some(RequestEvent::Ready { .. })));

    gate.add_permits(2);
    for submitted in [first, second, third] {
        assert_eq!(submitted.collect().await.unwrap().head.code, 200);
    }

    let stats = dispatcher.registry().stats(&key("svca")).unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.available_permits, 2);
    assert_eq!(connector.state.connects(), 2, "No extra clients for a saturated pool");
}

/// Under load the number of in-flight requests never exceeds the pool size
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_never_exceeds_capacity() {
    let connector = ScriptedConnector::new();
    connector.delay(Duration::from_millis(10));
    let dispatcher = dispatcher(&connector, &config(3));

    let submitted: Vec<_> = (0..20)
        .map(|i| {
            dispatcher
                .submit(HttpsRequest::new(format!("https://svcA/{i}")))
                .unwrap()
        })
        .collect();

    for request in submitted {
        assert_eq!(request.collect().await.unwrap().head.code, 200);
    }

    assert!(
        connector.state.max_in_flight() <= 3,
        "saw {} concurrent requests on a pool of 3",
        connector.state.max_in_flight()
    );
    let stats = dispatcher.registry().stats(&key("svca")).unwrap();
    assert_eq!(stats.available_permits + stats.active, stats.capacity);
    assert_eq!(stats.available_permits, 3);
    assert_eq!(dispatcher.registry().metrics_snapshot().requests_total, 20);
}

/// Acquire/release pairs keep permits + active == capacity after each pair
#[tokio::test]
async fn test_permit_accounting_after_each_pair() {
    let connector = ScriptedConnector::new();
    let registry = ConnectionPoolRegistry::new(connector, &config(3));
    let pool = registry.pool_for(&key("svca")).await.unwrap();

    for round in 0..6 {
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let mid = pool.stats();
        assert_eq!(mid.active, 2);
        assert_eq!(mid.available_permits + mid.active, 3);

        a.release(round % 2 == 0);
        b.release(false);

        let after = pool.stats();
        assert_eq!(after.active, 0);
        assert_eq!(after.available_permits, 3, "round {round}");
    }
}

/// Requests to different destinations do not share a bound
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_destinations_have_independent_bounds() {
    let connector = ScriptedConnector::new();
    let gate = connector.gate();
    let dispatcher = dispatcher(&connector, &config(1));

    let mut a = dispatcher.submit(HttpsRequest::new("https://svcA/")).unwrap();
    let mut b = dispatcher.submit(HttpsRequest::new("https://svcB/")).unwrap();
    assert!(matches!(a.events.recv().await, Some(RequestEvent::Ready { .. })));
    assert!(matches!(b.events.recv().await, Some(RequestEvent::Ready { .. })));

    gate.add_permits(2);
    a.collect().await.unwrap();
    b.collect().await.unwrap();

    wait_until(|| dispatcher.registry().metrics_snapshot().requests_in_flight == 0).await;
    assert_eq!(dispatcher.registry().destinations().len(), 2);
}
