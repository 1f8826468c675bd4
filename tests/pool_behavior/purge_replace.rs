// ABOUTME: Behavioral tests for broken-client detection and in-place replacement

use std::time::Duration;

use crate::fixtures::{config, dispatcher, key, wait_until, Reply, ScriptedConnector};
use overlay_https::pool::{ClientId, ConnectionPoolRegistry, EntryState};
use overlay_https::request::{HttpsRequest, RequestError, RequestEvent};
use overlay_https::transport::{TransportError, STATUS_TRANSPORT_ERROR};
use pretty_assertions::assert_eq;

/// A request ending with status -1 marks its client broken
#[tokio::test]
async fn test_negative_status_marks_entry_broken() {
    let connector = ScriptedConnector::new();
    connector.script([Reply::status(-1, vec![])]);
    let dispatcher = dispatcher(&connector, &config(2));

    let response = dispatcher
        .submit(HttpsRequest::new("https://svcA/"))
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(response.head.code, -1);
    assert!(response.body.is_empty());

    let stats = dispatcher.registry().stats(&key("svca")).unwrap();
    assert_eq!(stats.broken, 1);
    assert_eq!(stats.free, 1);
    assert_eq!(stats.available_permits, 2);
}

/// With a single entry, the next request replaces the broken client before using it
#[tokio::test]
async fn test_only_entry_broken_is_replaced_on_next_request() {
    let connector = ScriptedConnector::new();
    connector.script([Reply::status(-1, vec![])]);
    let dispatcher = dispatcher(&connector, &config(1));

    dispatcher
        .submit(HttpsRequest::new("https://svcA/"))
        .unwrap()
        .collect()
        .await
        .unwrap();
    let pool = dispatcher.registry().get(&key("svca")).unwrap();
    let broken_id = pool.slots()[0].id;
    assert_eq!(pool.slots()[0].state, EntryState::Broken);

    let response = dispatcher
        .submit(HttpsRequest::new("https://svcA/"))
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(response.head.code, 200);

    let slot = pool.slots()[0];
    assert_ne!(slot.id, broken_id, "Broken client must be replaced, not reused");
    assert_eq!(slot.state, EntryState::Free);
    assert_eq!(connector.state.connects(), 2);
    assert_eq!(dispatcher.registry().metrics_snapshot().clients_replaced, 1);
}

/// acquire() itself replaces broken entries when no free entry is left
#[tokio::test]
async fn test_acquire_triggers_replacement_without_registry() {
    let connector = ScriptedConnector::new();
    let state = connector.state.clone();
    let registry = ConnectionPoolRegistry::new(connector, &config(1));
    let pool = registry.pool_for(&key("svca")).await.unwrap();

    let lease = pool.acquire().await.unwrap();
    let old_id = lease.client_id();
    let old_serial = lease.client().serial;
    lease.release(true);

    let lease = pool.acquire().await.unwrap();
    assert_ne!(lease.client_id(), old_id);
    assert_ne!(lease.client().serial, old_serial);
    assert_eq!(state.connects(), 2);
    lease.release(false);
}

/// Release with error then purge: new identity, Free afterwards
#[tokio::test]
async fn test_release_error_then_purge_changes_identity() {
    let registry = ConnectionPoolRegistry::new(ScriptedConnector::new(), &config(3));
    let pool = registry.pool_for(&key("svca")).await.unwrap();

    let lease = pool.acquire().await.unwrap();
    let slot = lease.slot();
    let old_id = lease.client_id();
    lease.release(true);

    assert_eq!(pool.purge_and_replace().await.unwrap(), 1);
    let after = pool.slots()[slot];
    assert_ne!(after.id, old_id);
    assert_eq!(after.state, EntryState::Free);
}

/// Purging with nothing flagged changes nothing
#[tokio::test]
async fn test_purge_is_idempotent_when_nothing_is_broken() {
    let connector = ScriptedConnector::new();
    let state = connector.state.clone();
    let registry = ConnectionPoolRegistry::new(connector, &config(3));
    let pool = registry.pool_for(&key("svca")).await.unwrap();

    let before: Vec<ClientId> = pool.slots().iter().map(|s| s.id).collect();
    assert_eq!(pool.purge_and_replace().await.unwrap(), 0);
    assert_eq!(pool.purge_and_replace().await.unwrap(), 0);
    let after: Vec<ClientId> = pool.slots().iter().map(|s| s.id).collect();

    assert_eq!(before, after);
    assert_eq!(state.connects(), 3);
}

/// A transport failure before any response surfaces as a -1 head with no body
#[tokio::test]
async fn test_transport_error_surfaces_through_headers() {
    let connector = ScriptedConnector::new();
    connector.script([Reply::TransportError]);
    let dispatcher = dispatcher(&connector, &config(1));

    let mut submitted = dispatcher.submit(HttpsRequest::new("https://svcA/")).unwrap();
    assert!(matches!(submitted.events.recv().await, Some(RequestEvent::Ready { .. })));

    match submitted.events.recv().await {
        Some(RequestEvent::Headers { head, .. }) => {
            assert_eq!(head.code, STATUS_TRANSPORT_ERROR);
            assert!(head.status_text.contains("connection reset"));
            assert!(head.headers.is_empty());
        }
        other => panic!("expected headers, got {other:?}"),
    }
    assert!(submitted.events.recv().await.is_none(), "No body events after an error head");

    assert_eq!(dispatcher.registry().stats(&key("svca")).unwrap().broken, 1);
}

/// An error head reaches the caller while its client is still leased
#[tokio::test]
async fn test_error_head_delivered_before_release() {
    let connector = ScriptedConnector::new();
    connector.script([Reply::status(-1, vec![])]);
    let mut cfg = config(1);
    cfg.event_buffer = 1;
    let dispatcher = dispatcher(&connector, &cfg);

    let mut submitted = dispatcher.submit(HttpsRequest::new("https://svcA/")).unwrap();

    // Ready fills the one-slot buffer, so the error head waits on us
    wait_until(|| connector.state.requests().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = dispatcher.registry().stats(&key("svca")).unwrap();
    assert_eq!(stats.active, 1, "Client must stay leased until the head is delivered");
    assert_eq!(stats.broken, 0);
    assert_eq!(stats.available_permits, 0);

    assert!(matches!(submitted.events.recv().await, Some(RequestEvent::Ready { .. })));
    match submitted.events.recv().await {
        Some(RequestEvent::Headers { head, .. }) => assert_eq!(head.code, -1),
        other => panic!("expected headers, got {other:?}"),
    }
    assert!(submitted.events.recv().await.is_none());

    let stats = dispatcher.registry().stats(&key("svca")).unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.broken, 1);
    assert_eq!(stats.available_permits, 1);
}

/// A body that breaks mid-stream fails the request and the client
#[tokio::test]
async fn test_mid_body_failure_is_terminal_failure() {
    let connector = ScriptedConnector::new();
    connector.script([Reply::BrokenBody {
        chunks: vec!["partial"],
    }]);
    let dispatcher = dispatcher(&connector, &config(1));

    let err = dispatcher
        .submit(HttpsRequest::new("https://svcA/"))
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Transport(TransportError::Body(_))));

    let stats = dispatcher.registry().stats(&key("svca")).unwrap();
    assert_eq!(stats.broken, 1);
    assert_eq!(stats.available_permits, 1);
    assert_eq!(dispatcher.registry().metrics_snapshot().requests_failed, 1);
}

/// Non-2xx statuses purge by default and keep the client when configured not to
#[tokio::test]
async fn test_http_error_purge_policy() {
    let connector = ScriptedConnector::new();
    connector.script([Reply::status(500, vec!["oops"])]);
    let dispatcher_default = dispatcher(&connector, &config(1));
    let response = dispatcher_default
        .submit(HttpsRequest::new("https://svcA/"))
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(response.head.code, 500);
    assert_eq!(dispatcher_default.registry().stats(&key("svca")).unwrap().broken, 1);

    let lenient = ScriptedConnector::new();
    lenient.script([Reply::status(500, vec!["oops"])]);
    let mut cfg = config(1);
    cfg.purge_on_http_error = false;
    let dispatcher_lenient = dispatcher(&lenient, &cfg);
    dispatcher_lenient
        .submit(HttpsRequest::new("https://svcA/"))
        .unwrap()
        .collect()
        .await
        .unwrap();
    let stats = dispatcher_lenient.registry().stats(&key("svca")).unwrap();
    assert_eq!(stats.broken, 0);
    assert_eq!(stats.free, 1);
}
