mod common;

use acqsync::app_config::SocketConfig;
use acqsync::core::controller::ControllerHandle;
use acqsync::core::run::{RunOutcome, RunState};
use acqsync::workers::connection_worker::{ConnectionWorker, ResponseStatus, UpdateResponse};
use common::*;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Endpoint {
    controller: ControllerHandle,
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

async fn endpoint() -> Endpoint {
    let (controller, _tally) = spawn_controller(simulated_camera(1), MemorySinkOpener::new(), controller_config());
    let socket = SocketConfig {
        enabled: true,
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        max_line_bytes: 128,
    };
    let worker = ConnectionWorker::bind(&socket, controller.clone()).await.unwrap();
    let addr = worker.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = worker.spawn(shutdown_rx);
    Endpoint {
        controller,
        addr,
        shutdown,
        task,
    }
}

struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn connect(addr: SocketAddr) -> Peer {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Peer {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
    }

    /// `None` once the endpoint has closed the connection.
    async fn response(&mut self) -> Option<UpdateResponse> {
        let mut line = String::new();
        let read = within(self.reader.read_line(&mut line)).await.unwrap();
        if read == 0 {
            return None;
        }
        Some(serde_json::from_str(line.trim_end()).unwrap())
    }

    async fn request(&mut self, line: &str) -> UpdateResponse {
        self.send(&format!("{}\n", line)).await;
        self.response().await.expect("connection closed")
    }
}

fn exposure_update(version: u64, exposure: f64) -> String {
    format!(
        r#"{{"version": {}, "parameter_name": "exposure_time", "value": {}}}"#,
        version, exposure
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn in_order_update_is_acknowledged() {
    let endpoint = endpoint().await;
    let mut peer = Peer::connect(endpoint.addr).await;

    let response = peer.request(&exposure_update(1, 25.0)).await;
    assert_eq!(response, UpdateResponse::ok(1));
    let snapshot = endpoint.controller.snapshot().await.unwrap();
    assert_eq!(snapshot.parameters.version, 1);
    assert_eq!(snapshot.parameters.parameters.exposure_ms, 25.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_and_gapped_versions_are_rejected_with_the_current_version() {
    let endpoint = endpoint().await;
    let mut peer = Peer::connect(endpoint.addr).await;
    assert_eq!(peer.request(&exposure_update(1, 25.0)).await.status, ResponseStatus::Ok);

    let stale = peer.request(&exposure_update(1, 30.0)).await;
    assert_eq!(stale.status, ResponseStatus::Rejected);
    assert_eq!(stale.version, 1);
    assert!(stale.reason.unwrap().contains("stale"));

    let gap = peer.request(&exposure_update(3, 30.0)).await;
    assert_eq!(gap.status, ResponseStatus::Rejected);
    assert_eq!(gap.version, 1);
    assert!(gap.reason.unwrap().contains("gap"));

    assert_eq!(endpoint.controller.current_version().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_requests_keep_the_connection_open() {
    let endpoint = endpoint().await;
    let mut peer = Peer::connect(endpoint.addr).await;

    let garbage = peer.request("this is not json").await;
    assert_eq!(garbage.status, ResponseStatus::Rejected);
    assert!(garbage.reason.unwrap().contains("malformed"));

    let unknown = peer
        .request(r#"{"version": 1, "parameter_name": "focus", "value": 3}"#)
        .await;
    assert_eq!(unknown.status, ResponseStatus::Rejected);
    assert!(unknown.reason.unwrap().contains("unknown parameter"));

    let mistyped = peer
        .request(r#"{"version": 1, "parameter_name": "high_em_gain", "value": "yes"}"#)
        .await;
    assert_eq!(mistyped.status, ResponseStatus::Rejected);

    // Blank lines get no answer; CRLF endings are accepted.
    peer.send("\r\n\n").await;
    peer.send(&format!("{}\r\n", exposure_update(1, 12.5))).await;
    assert_eq!(peer.response().await, Some(UpdateResponse::ok(1)));
}

#[tokio::test(flavor = "multi_thread")]
async fn overlong_lines_are_rejected() {
    let endpoint = endpoint().await;
    let mut peer = Peer::connect(endpoint.addr).await;

    let long = format!(r#"{{"version": 1, "parameter_name": "exposure_time", "value": 1, "pad": "{}"}}"#, "x".repeat(300));
    let rejected = peer.request(&long).await;
    assert_eq!(rejected.status, ResponseStatus::Rejected);
    assert!(rejected.reason.unwrap().contains("exceeds 128 bytes"));

    assert_eq!(peer.request(&exposure_update(1, 15.0)).await, UpdateResponse::ok(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn second_peer_is_told_busy_and_disconnected() {
    let endpoint = endpoint().await;
    let mut first = Peer::connect(endpoint.addr).await;
    assert_eq!(first.request(&exposure_update(1, 25.0)).await.status, ResponseStatus::Ok);

    let mut second = Peer::connect(endpoint.addr).await;
    let busy = second.response().await.unwrap();
    assert_eq!(busy.status, ResponseStatus::Busy);
    assert_eq!(busy.version, 1);
    assert_eq!(second.response().await, None);

    // The first peer is unaffected.
    assert_eq!(first.request(&exposure_update(2, 26.0)).await, UpdateResponse::ok(2));

    // Once it leaves, the next peer is admitted.
    drop(first);
    let accepted = within(async {
        loop {
            let mut third = Peer::connect(endpoint.addr).await;
            let response = third.request(&exposure_update(3, 27.0)).await;
            if response.status != ResponseStatus::Busy {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(accepted, UpdateResponse::ok(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_disconnect_does_not_affect_the_run() {
    let endpoint = endpoint().await;
    let controller = &endpoint.controller;
    controller.start_run(small_parameters(), memory_target("net")).await.unwrap();

    let mut peer = Peer::connect(endpoint.addr).await;
    let ack = peer.request(&exposure_update(1, 20.0)).await;
    assert_eq!(ack, UpdateResponse::ok(1));
    drop(peer);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.snapshot().await.unwrap().state, RunState::Running);

    let summary = controller.stop_run().await.unwrap().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(summary.applied_versions.contains(&1));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_signal_stops_the_endpoint() {
    let endpoint = endpoint().await;
    let mut peer = Peer::connect(endpoint.addr).await;
    assert_eq!(peer.request(&exposure_update(1, 25.0)).await.status, ResponseStatus::Ok);

    endpoint.shutdown.send(true).unwrap();
    within(endpoint.task).await.unwrap();
    // The connected peer is closed as well.
    assert_eq!(peer.response().await, None);
}
