//! Shared test fixtures: a scripted RouterOS device, stub seams, and a raw
//! protocol client.
#![allow(dead_code)]

use mikrotik_manager::queue::{CommandSink, QueueError};
use mikrotik_manager::upstream::{CommandError, DeviceLink, Row};
use ros_proto::reply::{encode_data_reply, encode_done, encode_trap_reply};
use ros_proto::{SentenceDecoder, encode_sentence};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ---------------------------------------------------------------------------
// Scripted RouterOS device
// ---------------------------------------------------------------------------

/// A canned reply for one command word.
#[derive(Clone)]
pub enum RouterReply {
    Rows(Vec<Row>),
    Trap(String),
}

/// A TCP stub speaking the device protocol.
///
/// Accepts any number of connections.  `/login` always succeeds, the
/// liveness probe gets one uptime row, anything else answers from the
/// script (default: empty `!done`).  Every received sentence is recorded.
pub struct StubRouter {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<Vec<String>>>>,
    script: Arc<Mutex<HashMap<String, RouterReply>>>,
}

impl StubRouter {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
        let script: Arc<Mutex<HashMap<String, RouterReply>>> = Arc::default();

        let seen_task = Arc::clone(&seen);
        let script_task = Arc::clone(&script);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_stub_connection(
                    stream,
                    Arc::clone(&seen_task),
                    Arc::clone(&script_task),
                ));
            }
        });

        StubRouter { addr, seen, script }
    }

    pub fn script(&self, command: &str, reply: RouterReply) {
        self.script
            .lock()
            .expect("script lock")
            .insert(command.to_owned(), reply);
    }

    /// All sentences received so far whose first word equals `command`.
    pub fn sentences_for(&self, command: &str) -> Vec<Vec<String>> {
        self.seen
            .lock()
            .expect("seen lock")
            .iter()
            .filter(|s| s.first().map(String::as_str) == Some(command))
            .cloned()
            .collect()
    }
}

async fn serve_stub_connection(
    mut stream: TcpStream,
    seen: Arc<Mutex<Vec<Vec<String>>>>,
    script: Arc<Mutex<HashMap<String, RouterReply>>>,
) {
    let mut decoder = SentenceDecoder::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.push_bytes(&chunk[..n]);
        loop {
            let sentence = match decoder.next_sentence() {
                Ok(Some(s)) => s,
                Ok(None) => break,
                Err(_) => return,
            };
            if sentence.is_empty() {
                continue;
            }
            let words: Vec<String> = sentence
                .iter()
                .map(|w| String::from_utf8_lossy(w).into_owned())
                .collect();
            let first = words[0].clone();
            seen.lock().expect("seen lock").push(words);

            let reply = if first == "/login" {
                encode_done()
            } else if let Some(scripted) = script.lock().expect("script lock").get(&first) {
                match scripted {
                    RouterReply::Rows(rows) => encode_data_reply(rows),
                    RouterReply::Trap(message) => encode_trap_reply(message),
                }
            } else if first == "/system/resource/print" {
                encode_data_reply(&[vec![("uptime".to_owned(), "1h".to_owned())]])
            } else {
                encode_done()
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stub seams
// ---------------------------------------------------------------------------

/// DeviceLink stub: scripted outcome, invocation counting.
pub struct StubLink {
    pub connected: AtomicBool,
    pub idle_secs: AtomicI64,
    pub calls: AtomicUsize,
    pub seen_words: Mutex<Vec<Vec<String>>>,
    response: Mutex<Result<Vec<Row>, CommandError>>,
}

impl StubLink {
    pub fn new(connected: bool, response: Result<Vec<Row>, CommandError>) -> Arc<Self> {
        Arc::new(StubLink {
            connected: AtomicBool::new(connected),
            idle_secs: AtomicI64::new(i64::MAX / 2),
            calls: AtomicUsize::new(0),
            seen_words: Mutex::new(Vec::new()),
            response: Mutex::new(response),
        })
    }

    pub fn set_idle_secs(&self, secs: i64) {
        self.idle_secs.store(secs, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl DeviceLink for StubLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn touch_live_activity(&self) {}

    fn live_idle_secs(&self) -> i64 {
        self.idle_secs.load(Ordering::Relaxed)
    }

    fn run_command(
        &self,
        words: Vec<String>,
    ) -> impl std::future::Future<Output = Result<Vec<Row>, CommandError>> + Send {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.seen_words.lock().expect("seen lock").push(words);
        let result = self.response.lock().expect("response lock").clone();
        async move { result }
    }
}

/// CommandSink stub capturing enqueued commands in memory.
pub struct StubSink {
    pub rows: Mutex<Vec<(i64, Vec<String>)>>,
    pub fail: AtomicBool,
}

impl StubSink {
    pub fn new() -> Arc<Self> {
        Arc::new(StubSink {
            rows: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn failing() -> Arc<Self> {
        let sink = Self::new();
        sink.fail.store(true, Ordering::Relaxed);
        sink
    }

    pub fn enqueued(&self) -> Vec<(i64, Vec<String>)> {
        self.rows.lock().expect("rows lock").clone()
    }
}

impl CommandSink for StubSink {
    fn enqueue(
        &self,
        device_id: i64,
        words: &[String],
    ) -> impl std::future::Future<Output = Result<i64, QueueError>> + Send {
        let result = if self.fail.load(Ordering::Relaxed) {
            Err(QueueError::Data("stub enqueue failure".to_owned()))
        } else {
            let mut rows = self.rows.lock().expect("rows lock");
            rows.push((device_id, words.to_vec()));
            Ok(rows.len() as i64)
        };
        async move { result }
    }
}

// ---------------------------------------------------------------------------
// Raw protocol client
// ---------------------------------------------------------------------------

/// A bare client speaking the wire protocol at a proxy listener.
pub struct TestClient {
    stream: TcpStream,
    decoder: SentenceDecoder,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("client connect");
        TestClient {
            stream,
            decoder: SentenceDecoder::new(),
        }
    }

    pub async fn send(&mut self, words: &[&str]) {
        self.stream
            .write_all(&encode_sentence(words))
            .await
            .expect("client send");
    }

    /// Read one sentence; None on clean EOF.  Panics after 5 s of silence.
    pub async fn read_sentence(&mut self) -> Option<Vec<String>> {
        let deadline = Duration::from_secs(5);
        loop {
            if let Some(sentence) = self.decoder.next_sentence().expect("client framing") {
                return Some(
                    sentence
                        .iter()
                        .map(|w| String::from_utf8_lossy(w).into_owned())
                        .collect(),
                );
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(deadline, self.stream.read(&mut chunk))
                .await
                .expect("client read timed out")
                .expect("client read");
            if n == 0 {
                return None;
            }
            self.decoder.push_bytes(&chunk[..n]);
        }
    }
}
