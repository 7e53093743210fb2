//! Read-only status server over the camera registry.
//!
//! Routes (GET only):
//! - `/health`
//! - `/cameras` camera status listing
//! - `/cameras/{id}/frame` latest annotated frame as JPEG
//! - `/cameras/{id}/count` latest person count
//!
//! An unknown camera, or one without a frame yet, answers 404
//! `{"error":"not_available"}`.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::registry::CameraRegistry;

const MAX_REQUEST_BYTES: u64 = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const NOT_AVAILABLE: &str = r#"{"error":"not_available"}"#;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8800".to_string(),
        }
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    registry: Arc<CameraRegistry>,
}

pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, registry: Arc<CameraRegistry>) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = Arc::clone(&shutdown);
        let registry = self.registry;
        let join = std::thread::Builder::new()
            .name("status-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &registry, &shutdown_thread) {
                    log::error!("status api stopped: {:#}", err);
                }
            })?;
        log::info!("status api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, registry: &CameraRegistry, shutdown: &AtomicBool) -> Result<()> {
    while !shutdown.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        if let Err(err) = serve(stream, registry) {
            log::warn!("status api request failed: {:#}", err);
        }
    }
    Ok(())
}

fn serve(stream: TcpStream, registry: &CameraRegistry) -> Result<()> {
    prepare_stream(&stream)?;
    let (method, path) = read_request_line(&stream)?;
    let response = route(registry, &method, &path);
    response.write_to(&stream)
}

#[derive(Debug, PartialEq, Eq)]
struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.as_bytes().to_vec(),
        }
    }

    fn serialized<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status: 200,
                content_type: "application/json",
                body,
            },
            Err(err) => {
                log::warn!("status api serialization failed: {}", err);
                Self::json(500, r#"{"error":"internal"}"#)
            }
        }
    }
}

#[derive(Serialize)]
struct CountBody<'a> {
    camera: &'a str,
    person_count: u32,
}

fn route(registry: &CameraRegistry, method: &str, path: &str) -> Response {
    if method != "GET" {
        return Response::json(405, r#"{"error":"method_not_allowed"}"#);
    }
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["health"] => Response::json(200, r#"{"status":"ok"}"#),
        ["cameras"] => Response::serialized(&registry.statuses()),
        ["cameras", id, "frame"] => match registry.get_frame(id) {
            Some(jpeg) => Response {
                status: 200,
                content_type: "image/jpeg",
                body: jpeg,
            },
            None => Response::json(404, NOT_AVAILABLE),
        },
        ["cameras", id, "count"] => match registry.get_person_count(id) {
            Some(person_count) => Response::serialized(&CountBody {
                camera: *id,
                person_count,
            }),
            None => Response::json(404, NOT_AVAILABLE),
        },
        _ => Response::json(404, r#"{"error":"not_found"}"#),
    }
}

/// Blocking IO with bounded reads and writes, so a stalled client cannot
/// hold the accept thread past shutdown.
fn prepare_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))
}

/// Method and query-less path from the request line. Headers are drained
/// but ignored.
fn read_request_line(stream: &TcpStream) -> Result<(String, String)> {
    let mut reader = BufReader::new(stream.take(MAX_REQUEST_BYTES));
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header == "\r\n" || header == "\n" {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("empty request"))?;
    let target = parts.next().ok_or_else(|| anyhow!("request line without path"))?;
    let path = match target.split_once('?') {
        Some((path, _query)) => path,
        None => target,
    };
    Ok((method.to_string(), path.to_string()))
}

impl Response {
    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            404 => "Not Found",
            405 => "Method Not Allowed",
            _ => "Internal Server Error",
        }
    }

    fn write_to(&self, mut stream: &TcpStream) -> Result<()> {
        write!(
            stream,
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            self.status,
            self.reason(),
            self.content_type,
            self.body.len()
        )?;
        stream.write_all(&self.body)?;
        stream.flush()?;
        Ok(())
    }
}
