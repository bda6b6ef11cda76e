//! End-to-end tests of the chunk-variant endpoints and measurement flow,
//! run against an in-process server bound to an ephemeral port.

use netgauge::server::SessionCreated;
use netgauge::{Config, Measurer, ProbeOutcome, ProbeScheduler, ProgressEvent, Server};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn spawn_server(config: Config) -> (SocketAddr, Arc<Server>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let server = Arc::new(Server::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        running
            .run_with_listener(listener)
            .await
            .expect("server run");
    });
    (addr, server)
}

async fn spawn_default_server() -> (SocketAddr, Arc<Server>) {
    spawn_server(Config::serve("127.0.0.1".to_string(), 0)).await
}

async fn create_session(http: &reqwest::Client, base: &str) -> String {
    let response = http
        .post(format!("{base}/session"))
        .send()
        .await
        .expect("POST /session");
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let created: SessionCreated = response.json().await.expect("session body");
    assert!(!created.session_id.is_empty());
    created.session_id
}

#[tokio::test]
async fn session_lifecycle() {
    let (addr, server) = spawn_default_server().await;
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    let sid = create_session(&http, &base).await;
    assert_eq!(server.registry().len(), 1);

    let deleted = http
        .delete(format!("{base}/session/{sid}"))
        .send()
        .await
        .expect("DELETE session");
    assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);
    assert!(server.registry().is_empty());

    // A second delete finds nothing.
    let again = http
        .delete(format!("{base}/session/{sid}"))
        .send()
        .await
        .expect("DELETE session again");
    assert_eq!(again.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_chunk_returns_exactly_the_requested_bytes() {
    let (addr, _server) = spawn_default_server().await;
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();
    let sid = create_session(&http, &base).await;

    for size in [32u64, 4096, 1 << 20] {
        let response = http
            .get(format!("{base}/session/{sid}/chunk/{size}"))
            .send()
            .await
            .expect("GET chunk");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body = response.bytes().await.expect("chunk body");
        assert_eq!(body.len() as u64, size);
    }
}

#[tokio::test]
async fn chunk_endpoints_reject_unknown_sessions() {
    let (addr, _server) = spawn_default_server().await;
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    let get = http
        .get(format!("{base}/session/no-such-session/chunk/32"))
        .send()
        .await
        .expect("GET chunk");
    assert_eq!(get.status(), reqwest::StatusCode::NOT_FOUND);

    let put = http
        .put(format!("{base}/session/no-such-session/chunk/32"))
        .body(vec![0u8; 32])
        .send()
        .await
        .expect("PUT chunk");
    assert_eq!(put.status(), reqwest::StatusCode::NOT_FOUND);

    let probe = http
        .get(format!("{base}/session/no-such-session/probe/p1"))
        .send()
        .await
        .expect("GET probe");
    assert_eq!(probe.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chunk_size_must_be_a_positive_integer() {
    let (addr, _server) = spawn_default_server().await;
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();
    let sid = create_session(&http, &base).await;

    let zero = http
        .get(format!("{base}/session/{sid}/chunk/0"))
        .send()
        .await
        .expect("GET chunk 0");
    assert_eq!(zero.status(), reqwest::StatusCode::BAD_REQUEST);

    let malformed = http
        .get(format!("{base}/session/{sid}/chunk/not-a-number"))
        .send()
        .await
        .expect("GET chunk malformed");
    assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn put_chunk_accepts_a_one_mebibyte_upload() {
    let (addr, _server) = spawn_default_server().await;
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();
    let sid = create_session(&http, &base).await;

    let size = 1u64 << 20;
    let response = http
        .put(format!("{base}/session/{sid}/chunk/{size}"))
        .body(vec![0u8; size as usize])
        .send()
        .await
        .expect("PUT chunk");
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn probe_endpoint_answers_with_no_content() {
    let (addr, _server) = spawn_default_server().await;
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();
    let sid = create_session(&http, &base).await;

    let response = http
        .get(format!("{base}/session/{sid}/probe/some-probe-id"))
        .send()
        .await
        .expect("GET probe");
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn probe_scheduler_holds_its_cadence() {
    let (addr, _server) = spawn_default_server().await;
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();
    let sid = create_session(&http, &base).await;

    let scheduler = ProbeScheduler::new(
        reqwest::Client::new(),
        base,
        sid,
        Duration::from_millis(50),
        None,
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();
    let samples = task.await.expect("probe task");

    // Nominally 10 probes at a 50 ms cadence; leave slack for timing noise.
    assert!(
        (5..=12).contains(&samples.len()),
        "unexpected probe count {}",
        samples.len()
    );
    for sample in &samples {
        assert_eq!(sample.outcome, ProbeOutcome::Success);
        assert!(sample.rtt > Duration::ZERO);
    }
}

#[tokio::test]
async fn probe_scheduler_tolerates_failing_probes() {
    let (addr, _server) = spawn_default_server().await;
    let base = format!("http://{addr}");

    // No session was created for this id, so every probe comes back 404;
    // the scheduler must keep going regardless.
    let scheduler = ProbeScheduler::new(
        reqwest::Client::new(),
        base,
        "no-such-session".to_string(),
        Duration::from_millis(50),
        None,
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    let samples = task.await.expect("probe task");

    assert!(samples.len() >= 2);
    for sample in &samples {
        assert_eq!(sample.outcome, ProbeOutcome::Status(404));
    }
}

#[tokio::test]
async fn chunk_measurement_end_to_end() {
    let (addr, server) = spawn_default_server().await;

    let config = Config::measure(addr.ip().to_string(), addr.port())
        .with_budget(Duration::from_millis(400))
        .with_probe_interval(Duration::from_millis(25))
        .with_sample_interval(Duration::from_millis(100));

    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let measurer = Measurer::new(config)
        .expect("measurer")
        .with_callback(move |event: ProgressEvent| {
            sink.lock().expect("events lock").push(event);
        });

    measurer.run().await.expect("measurement run");

    let events = events.lock().expect("events lock");
    let sessions = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::SessionCreated { .. }))
        .count();
    assert_eq!(sessions, 1);

    let chunks = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::ChunkCompleted { .. }))
        .count();
    assert!(chunks >= 2, "expected chunks in both directions, got {chunks}");

    let directions = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::DirectionCompleted { .. }))
        .count();
    assert_eq!(directions, 2);

    let probes = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Probe(_)))
        .count();
    assert!(probes >= 1, "expected at least one probe");

    // The measurer cleans up its session on the way out.
    assert!(server.registry().is_empty());
}

#[tokio::test]
async fn measurer_fails_fast_without_a_server() {
    // Bind and immediately drop a listener so the port is known-dead.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let config = Config::measure(addr.ip().to_string(), addr.port())
        .with_budget(Duration::from_millis(200));
    let measurer = Measurer::new(config).expect("measurer");
    assert!(measurer.run().await.is_err());
}
