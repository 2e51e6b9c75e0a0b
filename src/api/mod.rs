use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::transport::parse_webhook;
use crate::{now_epoch_ms, BatchScheduler, SubmitOutcome};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const HEALTH_BODY: &str = r#"{"status":"healthy","service":"stream-digest"}"#;

#[derive(Debug)]
pub struct WebhookHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WebhookHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("webhook listener thread panicked"))?;
        }
        Ok(())
    }
}

/// Accepts streaming-server webhooks and feeds their detections to a scheduler.
pub struct WebhookServer {
    addr: String,
    scheduler: Arc<BatchScheduler>,
}

impl WebhookServer {
    pub fn new(addr: impl Into<String>, scheduler: Arc<BatchScheduler>) -> Self {
        Self {
            addr: addr.into(),
            scheduler,
        }
    }

    pub fn spawn(self) -> Result<WebhookHandle> {
        let configured_addr: SocketAddr = self
            .addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("failed to bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let scheduler = self.scheduler;
        let join = std::thread::Builder::new()
            .name("digest-webhook".to_string())
            .spawn(move || {
                if let Err(err) = run_listener(listener, &scheduler, shutdown_thread) {
                    log::error!("webhook listener stopped: {}", err);
                }
            })
            .context("failed to spawn webhook listener thread")?;
        log::info!("webhook listener on http://{}", addr);

        Ok(WebhookHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_listener(
    listener: TcpListener,
    scheduler: &BatchScheduler,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = handle_connection(stream, scheduler) {
                    log::warn!("webhook request from {} rejected: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, scheduler: &BatchScheduler) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, HEALTH_BODY),
        ("POST", "/webhook") => handle_webhook(&mut stream, &request, scheduler),
        (_, "/health") | (_, "/webhook") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn handle_webhook(
    stream: &mut TcpStream,
    request: &HttpRequest,
    scheduler: &BatchScheduler,
) -> Result<()> {
    let parsed = match parse_webhook(&request.body, now_epoch_ms()) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::warn!("webhook body rejected: {}", err);
            return write_json_response(stream, 400, r#"{"error":"invalid_json"}"#);
        }
    };

    if !parsed.is_detection_event() {
        log::info!("{} event for {}", parsed.event_name, parsed.stream_key);
        return write_json_response(stream, 200, r#"{"status":"success","accepted":0}"#);
    }

    let mut accepted = 0usize;
    for detection in parsed.detections {
        match scheduler.submit(detection) {
            Ok(SubmitOutcome::Accepted) | Ok(SubmitOutcome::FlushedEarly) => accepted += 1,
            Ok(SubmitOutcome::Skipped) | Ok(SubmitOutcome::Rejected) => {}
            Err(err) => {
                log::error!("submit for {} failed: {}", parsed.stream_key, err);
                return write_json_response(stream, 500, r#"{"error":"internal"}"#);
            }
        }
    }
    log::debug!(
        "{}: {} detection(s) accepted from webhook",
        parsed.stream_key,
        accepted
    );
    let body = serde_json::json!({ "status": "success", "accepted": accepted });
    write_response(stream, 200, "application/json", body.to_string().as_bytes())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large ({} bytes)", content_length));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}
