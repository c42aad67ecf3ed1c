//! Shared test helpers for host integration tests.
//!
//! Each integration test compiles this module separately, so some helpers
//! look unused from one file or another.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Some sandboxes forbid binding even loopback sockets.
pub async fn loopback_available() -> bool {
    TcpListener::bind("127.0.0.1:0").await.is_ok()
}

/// Canned response for one request.
pub struct Canned {
    pub status_line: &'static str,
    pub body: Vec<u8>,
    pub delay: Option<Duration>,
}

impl Canned {
    pub fn json(status_line: &'static str, body: &str) -> Self {
        Self {
            status_line,
            body: body.as_bytes().to_vec(),
            delay: None,
        }
    }

    pub fn bytes(status_line: &'static str, body: Vec<u8>) -> Self {
        Self {
            status_line,
            body,
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Serve one request with `canned` and hand back the raw request bytes.
pub async fn serve_once(canned: Canned) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let raw = read_request(&mut stream).await;
            let _ = tx.send(raw);
            if let Some(d) = canned.delay {
                tokio::time::sleep(d).await;
            }
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n",
                canned.status_line,
                canned.body.len()
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&canned.body).await;
            let _ = stream.shutdown().await;
        }
    });
    (addr, rx)
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut raw = Vec::new();
    let mut header_end = None;
    let mut content_length = 0usize;
    loop {
        let mut chunk = vec![0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
        if header_end.is_none() {
            if let Some(idx) = find_subslice(&raw, b"\r\n\r\n") {
                let end = idx + 4;
                header_end = Some(end);
                content_length = parse_content_length(&raw[..end]);
            }
        }
        if let Some(end) = header_end {
            if raw.len() >= end + content_length {
                break;
            }
        }
    }
    raw
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_content_length(header_bytes: &[u8]) -> usize {
    let Ok(text) = std::str::from_utf8(header_bytes) else {
        return 0;
    };
    text.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                return value.trim().parse::<usize>().ok();
            }
            None
        })
        .unwrap_or(0)
}

/// Request line, lowercased header block, and body.
pub struct Captured {
    pub request_line: String,
    pub headers: String,
    pub body: Vec<u8>,
}

pub fn split_request(raw: &[u8]) -> Captured {
    let end = find_subslice(raw, b"\r\n\r\n").expect("request header delimiter");
    let head = String::from_utf8_lossy(&raw[..end]).to_string();
    let (request_line, headers) = head.split_once("\r\n").unwrap_or((head.as_str(), ""));
    Captured {
        request_line: request_line.to_string(),
        headers: headers.to_ascii_lowercase(),
        body: raw[end + 4..].to_vec(),
    }
}
