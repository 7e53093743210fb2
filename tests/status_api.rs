use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use occupancy_kernel::api::{ApiConfig, ApiServer};
use occupancy_kernel::detect::{shared, ScriptedBackend};
use occupancy_kernel::ingest::ScriptedOpener;
use occupancy_kernel::{CameraRegistry, FrameRefresher};

fn get(addr: SocketAddr, path: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).expect("send request");
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    (head, raw[split + 4..].to_vec())
}

#[test]
fn serves_counts_frames_and_not_available() {
    let opener = ScriptedOpener::new(32, 24);
    let registry = Arc::new(CameraRegistry::new(Arc::new(opener)));
    registry.add_camera("101", "stub://101");
    registry.add_camera("102", "stub://102");
    FrameRefresher::new(Arc::clone(&registry), shared(ScriptedBackend::constant(3)))
        .tick();
    registry.add_camera("103", "stub://103");

    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        Arc::clone(&registry),
    )
    .spawn()
    .expect("spawn api");

    let (head, body) = get(handle.addr, "/health");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, br#"{"status":"ok"}"#);

    let (head, body) = get(handle.addr, "/cameras/101/count");
    assert!(head.starts_with("HTTP/1.1 200"));
    let json: serde_json::Value = serde_json::from_slice(&body).expect("count json");
    assert_eq!(json["person_count"], 3);

    let (head, body) = get(handle.addr, "/cameras/102/frame");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.contains("Content-Type: image/jpeg"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    let (head, body) = get(handle.addr, "/cameras/103/frame");
    assert!(head.starts_with("HTTP/1.1 404"));
    assert_eq!(body, br#"{"error":"not_available"}"#);

    let (head, _) = get(handle.addr, "/cameras/999/count");
    assert!(head.starts_with("HTTP/1.1 404"));

    let (_, body) = get(handle.addr, "/cameras");
    let json: serde_json::Value = serde_json::from_slice(&body).expect("cameras json");
    let ids: Vec<&str> = json
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|camera| camera["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["101", "102", "103"]);

    handle.stop().expect("stop api");
}
