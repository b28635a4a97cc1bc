mod common;

use std::time::Duration;

use common::{test_state, TOKEN};
use moegen_cli::http::server::serve;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Read from `stream` until `needle` shows up in what was received.
async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before {needle:?}");
        seen.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&seen).into_owned();
        if text.contains(needle) {
            return text;
        }
    }
}

#[tokio::test]
async fn shutdown_completes_with_open_event_stream() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let shutdown_tx = state.shutdown_tx.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve(listener, state));

    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /api/backend/stream HTTP/1.1\r\nHost: {addr}\r\nX-Backend-Token: {TOKEN}\r\nAccept: text/event-stream\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let head = read_until(&mut client, "event: state").await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    shutdown_tx.send(()).unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(3), server).await;
    let result = finished.expect("server kept running with a stream client attached");
    assert!(result.unwrap().is_ok());

    // The stream ends rather than hanging the client.
    let mut rest = Vec::new();
    let drained = tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut rest)).await;
    assert!(drained.is_ok());
}
