//! End-to-end tests of the continuous-stream variant against an
//! in-process server.

use netgauge::stream::{self, DOWNLOAD_PATH, MIN_MESSAGE_SIZE, UPLOAD_PATH};
use netgauge::{Config, Direction, Measurer, ProgressEvent, Server, Variant};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn spawn_server(budget: Duration) -> (SocketAddr, Arc<Server>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let config = Config::serve("127.0.0.1".to_string(), 0).with_budget(budget);
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

#[tokio::test]
async fn download_stream_delivers_bytes_within_budget() {
    let (addr, _server) = spawn_server(Duration::from_secs(2)).await;
    let base = format!("ws://{addr}");

    let mut transport = stream::dial(&base, DOWNLOAD_PATH).await.expect("dial");
    let cancel = CancellationToken::new();
    let sample = stream::receiver(
        &mut transport,
        Duration::from_millis(300),
        Duration::from_millis(100),
        "download",
        &cancel,
    )
    .await
    .expect("receiver");

    assert!(sample.bytes >= MIN_MESSAGE_SIZE as u64);
    assert!(sample.bits_per_second > 0.0);
}

#[tokio::test]
async fn upload_stream_sends_adaptively_sized_frames() {
    let (addr, _server) = spawn_server(Duration::from_secs(2)).await;
    let base = format!("ws://{addr}");

    let mut transport = stream::dial(&base, UPLOAD_PATH).await.expect("dial");
    let cancel = CancellationToken::new();
    let sample = stream::sender(
        &mut transport,
        Duration::from_millis(300),
        Duration::from_millis(100),
        "upload",
        &cancel,
    )
    .await
    .expect("sender");

    assert!(sample.bytes >= MIN_MESSAGE_SIZE as u64);
}

#[tokio::test]
async fn upgrade_requires_the_subprotocol() {
    let (addr, _server) = spawn_server(Duration::from_secs(2)).await;
    let url = format!("ws://{addr}{DOWNLOAD_PATH}");

    // A plain upgrade without the measurement subprotocol is refused.
    let result = tokio_tungstenite::connect_async(&url).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 400);
        }
        Err(other) => panic!("expected an HTTP rejection, got {other}"),
        Ok(_) => panic!("upgrade without subprotocol must not succeed"),
    }
}

#[tokio::test]
async fn stream_measurement_end_to_end() {
    let (addr, _server) = spawn_server(Duration::from_secs(2)).await;

    let config = Config::measure(addr.ip().to_string(), addr.port())
        .with_variant(Variant::Stream)
        .with_budget(Duration::from_millis(300))
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
    let mut download_bytes = None;
    let mut upload_bytes = None;
    for event in events.iter() {
        if let ProgressEvent::StreamCompleted { direction, sample } = event {
            match direction {
                Direction::Download => download_bytes = Some(sample.bytes),
                Direction::Upload => upload_bytes = Some(sample.bytes),
            }
        }
    }
    assert!(download_bytes.expect("download completed") > 0);
    assert!(upload_bytes.expect("upload completed") > 0);
}
