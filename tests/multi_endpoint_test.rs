//! MultiEndpointConnection tests against the in-memory transport

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use common::{collaborators, settle, MockTransport};
use maxwell_client::{
    ConnectionError, EndpointPicker, Event, MultiEndpointConnection, Options, ProtocolMsg, ReqReq,
};

/// Picker cycling through `endpoints`, counting calls.
fn rotating(endpoints: &[&str], calls: Arc<AtomicUsize>) -> Arc<dyn EndpointPicker> {
    let endpoints: Vec<String> = endpoints.iter().map(|e| e.to_string()).collect();
    Arc::new(move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        let endpoint = endpoints[n % endpoints.len()].clone();
        async move { Ok::<_, anyhow::Error>(endpoint) }
    })
}

fn count(multi: &MultiEndpointConnection, event: Event) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    multi.add_listener(event, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    counter
}

fn hits(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[tokio::test(start_paused = true)]
async fn test_multi_hello_round() {
    let transport = MockTransport::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let multi = MultiEndpointConnection::with_collaborators(
        rotating(&["localhost:10000"], Arc::clone(&calls)),
        Options::default(),
        collaborators(&transport),
    );

    multi.wait_open(None).await.unwrap();
    assert!(multi.is_open());
    assert_eq!(multi.endpoint().as_deref(), Some("localhost:10000"));

    let reply = multi
        .request(
            ProtocolMsg::ReqReq(ReqReq::new("/hello", "{}")),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();
    let ProtocolMsg::ReqRep(reply) = reply else {
        panic!("expected req_rep, got {:?}", reply);
    };
    assert_eq!(reply.payload, "\"world\"");
    assert_eq!(hits(&calls), 1);
    multi.close();
}

#[tokio::test(start_paused = true)]
async fn test_multi_ping_request_times_out_with_summary() {
    let transport = MockTransport::new();
    let multi = MultiEndpointConnection::with_collaborators(
        rotating(&["localhost:10000"], Arc::new(AtomicUsize::new(0))),
        Options::default(),
        collaborators(&transport),
    );
    multi.wait_open(Some(Duration::from_millis(1000))).await.unwrap();

    let err = multi
        .request(ProtocolMsg::ping(), Some(Duration::from_millis(2000)))
        .await
        .unwrap_err();
    assert_eq!(err, ConnectionError::Timeout(r#"{"ref":1}"#.into()));
    multi.close();
}

#[tokio::test(start_paused = true)]
async fn test_multi_wait_open_times_out_when_unreachable() {
    let transport = MockTransport::new();
    transport.set_unreachable("localhost:1");
    let multi = MultiEndpointConnection::with_collaborators(
        rotating(&["localhost:1"], Arc::new(AtomicUsize::new(0))),
        Options::default(),
        collaborators(&transport),
    );

    let err = multi
        .wait_open(Some(Duration::from_millis(1000)))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Timeout to wait: waiter: 0");
    multi.close();
}

#[tokio::test(start_paused = true)]
async fn test_reopen_builds_new_connection_on_fresh_pick() {
    let transport = MockTransport::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let multi = MultiEndpointConnection::with_collaborators(
        rotating(&["a:1", "b:1"], Arc::clone(&calls)),
        Options::default(),
        collaborators(&transport),
    );
    let disconnecting = count(&multi, Event::Disconnecting);
    let sources = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&sources);
    multi.add_listener(Event::Connected, move |relayed| {
        seen.lock()
            .unwrap()
            .push((relayed.connection.id(), relayed.connection.endpoint().to_string()));
    });

    multi.wait_open(None).await.unwrap();
    let first = multi.connection().unwrap();
    multi.reopen();

    tokio::time::sleep(Duration::from_millis(3500)).await;

    let second = multi.connection().unwrap();
    assert_ne!(first, second);
    assert!(multi.is_open());
    assert_eq!(multi.endpoint().as_deref(), Some("b:1"));
    assert_eq!(hits(&calls), 2);
    assert_eq!(
        *sources.lock().unwrap(),
        vec![(1, "a:1".to_string()), (2, "b:1".to_string())]
    );
    // Closing the replaced connection is not relayed.
    assert_eq!(hits(&disconnecting), 1);
    assert_eq!(
        transport.opened(),
        vec!["ws://a:1/$ws".to_string(), "ws://b:1/$ws".to_string()]
    );
    multi.close();
}

#[tokio::test(start_paused = true)]
async fn test_corrupted_then_disconnected_repicks_once() {
    let transport = MockTransport::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let multi = MultiEndpointConnection::with_collaborators(
        rotating(&["localhost:10000"], Arc::clone(&calls)),
        Options::default(),
        collaborators(&transport),
    );
    multi.wait_open(None).await.unwrap();
    let corrupted = count(&multi, Event::Corrupted);
    let disconnected = count(&multi, Event::Disconnected);

    transport.fail_latest("broken pipe");
    transport.drop_latest();
    settle().await;
    assert_eq!(hits(&corrupted), 1);
    assert_eq!(hits(&disconnected), 1);

    tokio::time::sleep(Duration::from_millis(10_000)).await;
    assert_eq!(hits(&calls), 2);
    assert_eq!(transport.opened().len(), 2);
    assert!(multi.is_open());
    multi.close();
}

#[tokio::test(start_paused = true)]
async fn test_picker_failure_is_retried_after_delay() {
    let transport = MockTransport::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let picker: Arc<dyn EndpointPicker> = Arc::new(move || {
        let n = counted.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                anyhow::bail!("registry unavailable");
            }
            Ok("localhost:10000".to_string())
        }
    });
    let multi =
        MultiEndpointConnection::with_collaborators(picker, Options::default(), collaborators(&transport));

    let started = Instant::now();
    multi.wait_open(Some(Duration::from_millis(5000))).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(3000));
    assert_eq!(hits(&calls), 2);
    multi.close();
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_repicking() {
    let transport = MockTransport::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let multi = MultiEndpointConnection::with_collaborators(
        rotating(&["localhost:10000"], Arc::clone(&calls)),
        Options::default(),
        collaborators(&transport),
    );
    multi.wait_open(None).await.unwrap();
    let disconnected = count(&multi, Event::Disconnected);

    multi.close();
    multi.close();
    tokio::time::sleep(Duration::from_millis(10_000)).await;

    assert_eq!(hits(&disconnected), 1);
    assert_eq!(hits(&calls), 1);
    assert_eq!(transport.opened().len(), 1);
    assert!(!multi.is_open());
    assert_eq!(
        multi.send(&ProtocolMsg::ping()),
        Err(ConnectionError::NotConnected)
    );
}
