// ABOUTME: Behavioral tests for lazy pool construction and destination keying

use crate::fixtures::{config, dispatcher, key, wait_until, ScriptedConnector};
use overlay_https::pool::{DirectoryError, PoolError, PoolStats};
use overlay_https::request::{HttpsRequest, RequestError, RequestEvent};
use pretty_assertions::assert_eq;

/// First request to a destination builds the whole pool, then takes one client
#[tokio::test]
async fn test_first_request_builds_pool_and_activates_one_entry() {
    let connector = ScriptedConnector::new();
    let gate = connector.gate();
    let dispatcher = dispatcher(&connector, &config(2));
    let registry = dispatcher.registry();

    assert!(registry.is_empty());
    assert_eq!(connector.state.connects(), 0, "No client is built before the first request");

    let mut submitted = dispatcher
        .submit(HttpsRequest::new("https://svcA/"))
        .unwrap();

    let ready = submitted.events.recv().await.unwrap();
    assert!(matches!(ready, RequestEvent::Ready { .. }));

    assert_eq!(connector.state.connects(), 2, "Both entries are built eagerly");
    let stats = registry.stats(&key("svca")).unwrap();
    assert_eq!(stats.capacity, 2);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.free, 1);
    assert_eq!(stats.available_permits, 1);

    gate.add_permits(1);
    let response = submitted.collect().await.unwrap();
    assert_eq!(response.head.code, 200);

    assert_eq!(
        registry.stats(&key("svca")).unwrap(),
        PoolStats {
            capacity: 2,
            free: 2,
            active: 0,
            broken: 0,
            available_permits: 2,
        }
    );
    assert_eq!(registry.metrics_snapshot().pools_created, 1);
}

/// Equivalent spellings of a destination share one pool
#[tokio::test]
async fn test_normalized_keys_share_one_pool() {
    let connector = ScriptedConnector::new();
    let dispatcher = dispatcher(&connector, &config(2));

    for target in ["https://svcA/a", "HTTPS://SVCA:443/b", "https://svca/c?x=1"] {
        dispatcher
            .submit(HttpsRequest::new(target))
            .unwrap()
            .collect()
            .await
            .unwrap();
    }

    assert_eq!(
        dispatcher.registry().destinations(),
        vec!["https://svca".to_string()]
    );
    assert_eq!(connector.state.connects(), 2);

    let paths: Vec<String> = connector
        .state
        .requests()
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(paths, vec!["/a", "/b", "/c?x=1"]);
}

/// Different ports are different destinations
#[tokio::test]
async fn test_distinct_ports_get_distinct_pools() {
    let connector = ScriptedConnector::new();
    let dispatcher = dispatcher(&connector, &config(1));

    for target in ["https://svc:8443/", "https://svc:9443/"] {
        dispatcher
            .submit(HttpsRequest::new(target))
            .unwrap()
            .collect()
            .await
            .unwrap();
    }

    assert_eq!(
        dispatcher.registry().destinations(),
        vec!["https://svc:8443".to_string(), "https://svc:9443".to_string()]
    );
}

/// A full pool directory surfaces a capacity error as a failed request
#[tokio::test]
async fn test_pool_directory_capacity_error_is_reported() {
    let connector = ScriptedConnector::new();
    let mut cfg = config(1);
    cfg.max_destinations = Some(1);
    let dispatcher = dispatcher(&connector, &cfg);

    dispatcher
        .submit(HttpsRequest::new("https://first/"))
        .unwrap()
        .collect()
        .await
        .unwrap();

    let err = dispatcher
        .submit(HttpsRequest::new("https://second/"))
        .unwrap()
        .collect()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RequestError::Pool(PoolError::Directory(DirectoryError::CapacityExceeded { capacity: 1, .. }))
    ));
    assert_eq!(dispatcher.registry().len(), 1);
    assert_eq!(connector.state.connects(), 1);
}

/// Service names resolve through the service directory to an https key
#[tokio::test]
async fn test_service_name_resolves_to_pool() {
    let connector = ScriptedConnector::new();
    let dispatcher = dispatcher(&connector, &config(1));
    dispatcher
        .services()
        .upsert("billing", "billing.ziti:8443".parse().unwrap())
        .unwrap();

    dispatcher
        .submit(HttpsRequest::new("billing").path("/invoices"))
        .unwrap()
        .collect()
        .await
        .unwrap();

    let recorded = connector.state.requests();
    assert_eq!(recorded[0].destination, "https://billing.ziti:8443");
    assert_eq!(recorded[0].path, "/invoices");

    wait_until(|| dispatcher.registry().metrics_snapshot().requests_in_flight == 0).await;
}
