//! Local stand-in for the inference provider: a TcpListener that records each
//! request and answers with canned bytes.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// One canned answer, written piece by piece with `pause` in between. The
/// connection is closed after the last piece.
#[derive(Clone)]
pub struct Reply {
    pub parts: Vec<Vec<u8>>,
    pub pause: Duration,
}

impl Reply {
    pub fn status(code: u16, reason: &str, body: &str) -> Self {
        let raw = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            code,
            reason,
            body.len(),
            body
        );
        Self {
            parts: vec![raw.into_bytes()],
            pause: Duration::ZERO,
        }
    }

    /// `200` event stream, closed by EOF after the given events.
    pub fn sse(events: &[String]) -> Self {
        let mut raw = String::from(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n",
        );
        for e in events {
            raw.push_str(e);
        }
        Self {
            parts: vec![raw.into_bytes()],
            pause: Duration::ZERO,
        }
    }

    /// Chunked `200` that sends `events` and then drops the socket without the
    /// terminating chunk.
    pub fn chunked_then_reset(events: &[String]) -> Self {
        let mut parts = vec![
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n"
                .to_vec(),
        ];
        for e in events {
            parts.push(format!("{:x}\r\n{}\r\n", e.len(), e).into_bytes());
        }
        Self {
            parts,
            pause: Duration::from_millis(30),
        }
    }

    /// Raw bytes, for image responses.
    pub fn bytes(code: u16, content_type: &str, body: &[u8]) -> Self {
        let mut raw = format!(
            "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            code,
            content_type,
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        Self {
            parts: vec![raw],
            pause: Duration::ZERO,
        }
    }
}

pub fn delta(text: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"choices":[{"index":0,"delta":{"content":text}}]})
    )
}

pub fn done() -> String {
    "data: [DONE]\n\n".to_string()
}

pub struct FakeUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeUpstream {
    /// Serve `replies` in order, one per connection; the last one repeats.
    pub async fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let served = Arc::new(AtomicUsize::new(0));

        let log = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let i = served.fetch_add(1, Ordering::SeqCst);
                let reply = replies[i.min(replies.len() - 1)].clone();
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let request = read_http_request(&mut socket).await;
                    log.lock().expect("lock").push(request);
                    for (n, part) in reply.parts.iter().enumerate() {
                        if n > 0 && !reply.pause.is_zero() {
                            tokio::time::sleep(reply.pause).await;
                        }
                        if socket.write_all(part).await.is_err() {
                            return;
                        }
                        let _ = socket.flush().await;
                    }
                    tokio::time::sleep(reply.pause).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("lock").clone()
    }
}

async fn read_http_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf).to_string();
        if let Some(head_end) = text.find("\r\n\r\n") {
            let length = text[..head_end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}
