//! RouterOS API transport: one TCP connection to a device.
//!
//! Owns the socket and the incremental sentence decoder.  Callers serialize
//! access externally (the upstream session's lock); the transport itself
//! assumes exclusive use, so replies on the wire always belong to the last
//! sentence written.

use ros_proto::reply::{Reply, parse_reply};
use ros_proto::{Attrs, FrameError, SentenceDecoder, encode_sentence};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Per-reply read timeout inherited by every RPC, the liveness probe
/// included.
pub const RPC_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Result and error types
// ---------------------------------------------------------------------------

/// Outcome of one RPC on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResult {
    /// `!re` rows collected up to the terminating `!done`.
    Rows(Vec<Attrs>),
    /// The device refused the command with one or more `!trap` sentences.
    Trap { message: String },
}

/// Error type for transport operations.
#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    Frame(FrameError),
    /// The device closed the connection mid-reply.
    Closed,
    /// No reply within [`RPC_REPLY_TIMEOUT`].
    Timeout,
    /// `!fatal` from the device; the connection is dead.
    Fatal(String),
    /// The device rejected the login credentials.
    LoginRejected(String),
    /// A sentence that is not a reply arrived where a reply was expected.
    Protocol(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
            TransportError::Frame(e) => write!(f, "framing error: {}", e),
            TransportError::Closed => write!(f, "connection closed by device"),
            TransportError::Timeout => write!(f, "timed out waiting for reply"),
            TransportError::Fatal(r) => write!(f, "fatal from device: {}", r),
            TransportError::LoginRejected(m) => write!(f, "login rejected: {}", m),
            TransportError::Protocol(s) => write!(f, "protocol error: {}", s),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        TransportError::Frame(e)
    }
}

impl TransportError {
    /// Short classification tag surfaced in transient error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Io(_) | TransportError::Closed => "ConnectionError",
            TransportError::Frame(_) => "FramingError",
            TransportError::Timeout => "TimeoutError",
            TransportError::Fatal(_) => "FatalError",
            TransportError::LoginRejected(_) => "LoginError",
            TransportError::Protocol(_) => "ProtocolError",
        }
    }

    /// The message body without the classification tag.
    pub fn detail(&self) -> String {
        match self {
            TransportError::Io(e) => e.to_string(),
            TransportError::Frame(e) => e.to_string(),
            TransportError::Closed => "connection closed by device".to_owned(),
            TransportError::Timeout => "timed out waiting for reply".to_owned(),
            TransportError::Fatal(r) => r.clone(),
            TransportError::LoginRejected(m) => m.clone(),
            TransportError::Protocol(s) => s.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ApiTransport
// ---------------------------------------------------------------------------

/// An established API connection to a device.
pub struct ApiTransport {
    stream: TcpStream,
    decoder: SentenceDecoder,
}

impl ApiTransport {
    /// Open a TCP connection to the device's API port.
    ///
    /// Callers wrap this (plus [`ApiTransport::login`]) in the dial timeout.
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(ApiTransport {
            stream,
            decoder: SentenceDecoder::new(),
        })
    }

    /// Post-6.43 plaintext login.  A trap reply means bad credentials.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<(), TransportError> {
        let words = vec![
            "/login".to_owned(),
            format!("=name={}", user),
            format!("=password={}", password),
        ];
        match self.run(&words).await? {
            RpcResult::Rows(_) => Ok(()),
            RpcResult::Trap { message } => Err(TransportError::LoginRejected(message)),
        }
    }

    /// Send one sentence and collect its reply sentences up to `!done`.
    pub async fn run(&mut self, words: &[String]) -> Result<RpcResult, TransportError> {
        self.stream.write_all(&encode_sentence(words)).await?;

        let mut rows: Vec<Attrs> = Vec::new();
        let mut traps: Vec<String> = Vec::new();
        loop {
            let sentence = self.read_sentence().await?;
            if sentence.is_empty() {
                continue;
            }
            match parse_reply(&sentence) {
                Some(Reply::Data(attrs)) => rows.push(attrs),
                Some(Reply::Trap { message, .. }) => traps.push(message),
                Some(Reply::Done(_)) => {
                    return if traps.is_empty() {
                        Ok(RpcResult::Rows(rows))
                    } else {
                        Ok(RpcResult::Trap {
                            message: traps.join(", "),
                        })
                    };
                }
                Some(Reply::Fatal(reason)) => return Err(TransportError::Fatal(reason)),
                None => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected sentence from device: {}",
                        sentence
                            .first()
                            .map(|w| String::from_utf8_lossy(w).into_owned())
                            .unwrap_or_default()
                    )));
                }
            }
        }
    }

    async fn read_sentence(&mut self) -> Result<Vec<Vec<u8>>, TransportError> {
        loop {
            if let Some(sentence) = self.decoder.next_sentence()? {
                return Ok(sentence);
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(RPC_REPLY_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .map_err(|_| TransportError::Timeout)??;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            self.decoder.push_bytes(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ros_proto::reply::{encode_data_reply, encode_done, encode_trap_reply};
    use tokio::net::TcpListener;

    /// Minimal scripted device: accepts one connection, answers `/login`
    /// with `!done`, then replies to each sentence from the given script.
    async fn scripted_device(replies: Vec<Vec<u8>>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut decoder = SentenceDecoder::new();
            let mut script = replies.into_iter();
            loop {
                let mut chunk = [0u8; 1024];
                let n = match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.push_bytes(&chunk[..n]);
                while let Some(sentence) = decoder.next_sentence().expect("framing") {
                    if sentence.is_empty() {
                        continue;
                    }
                    let reply = if sentence[0] == b"/login" {
                        encode_done()
                    } else {
                        script.next().unwrap_or_else(encode_done)
                    };
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn run_collects_rows_until_done() {
        let rows = vec![vec![("uptime".to_owned(), "1h".to_owned())]];
        let addr = scripted_device(vec![encode_data_reply(&rows)]).await;

        let mut transport = ApiTransport::connect("127.0.0.1", addr.port())
            .await
            .expect("connect");
        transport.login("admin", "pw").await.expect("login");
        let result = transport
            .run(&["/system/resource/print".to_owned()])
            .await
            .expect("rpc");
        assert_eq!(result, RpcResult::Rows(rows));
    }

    #[tokio::test]
    async fn trap_reply_surfaces_as_trap_result() {
        let addr = scripted_device(vec![encode_trap_reply("no such command")]).await;

        let mut transport = ApiTransport::connect("127.0.0.1", addr.port())
            .await
            .expect("connect");
        transport.login("admin", "pw").await.expect("login");
        let result = transport.run(&["/bogus".to_owned()]).await.expect("rpc");
        assert_eq!(
            result,
            RpcResult::Trap {
                message: "no such command".to_owned()
            }
        );
    }
}
