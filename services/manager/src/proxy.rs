//! Local proxy listener and per-client session handler.
//!
//! One listener per enabled device on `127.0.0.1:<proxy_port>`, speaking the
//! same wire protocol as the device itself.  A client must log in with the
//! device's configured credentials before anything is forwarded.
//!
//! Per authenticated sentence the handler tries the upstream exactly once:
//! a trap goes back to the client as-is (the device refused the command and
//! a retry would change nothing), a transient failure lands the sentence in
//! the durable queue with an advisory trap, and a disconnected upstream
//! enqueues silently behind a `!done` so callers are not blocked.

use crate::config::DeviceConfig;
use crate::queue::CommandSink;
use crate::upstream::DeviceLink;
use ros_proto::FrameError;
use ros_proto::reply::{encode_data_reply, encode_done, encode_trap_reply, encode_trap_sentence};
use ros_proto::word::decode_length;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

/// Serve the given listener until it fails or the task is aborted.
pub async fn serve_device<L: DeviceLink, Q: CommandSink>(
    listener: TcpListener,
    device: Arc<DeviceConfig>,
    link: Arc<L>,
    queue: Arc<Q>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(device_id = device.id, client = %peer, "api client connected");
                let device = Arc::clone(&device);
                let link = Arc::clone(&link);
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_client(stream, &device, link.as_ref(), queue.as_ref()).await
                    {
                        debug!(device_id = device.id, error = %e, "api client closed with error");
                    }
                    debug!(device_id = device.id, "api client disconnected");
                });
            }
            Err(e) => {
                warn!(device_id = device.id, error = %e, "proxy accept failed");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-client session
// ---------------------------------------------------------------------------

/// Drive one client connection: login handshake, then dispatch per sentence.
pub async fn handle_client<L: DeviceLink, Q: CommandSink>(
    mut stream: TcpStream,
    device: &DeviceConfig,
    link: &L,
    queue: &Q,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.split();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut authenticated = false;

    'session: loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        // Split one raw sentence off at each zero-byte terminator.
        while let Some(pos) = buf.iter().position(|&b| b == 0x00) {
            let raw: Vec<u8> = buf.drain(..=pos).collect();
            link.touch_live_activity();

            let words = match sentence_words(&raw[..raw.len() - 1]) {
                Ok(words) => words,
                Err(e) => {
                    warn!(device_id = device.id, error = %e, "framing error from client, closing");
                    break 'session;
                }
            };
            if words.is_empty() {
                continue;
            }

            if !authenticated {
                if words.iter().any(|w| w == "/login") {
                    if login_matches(&words, device) {
                        info!(device_id = device.id, "api client authenticated");
                        writer.write_all(&encode_done()).await?;
                        authenticated = true;
                    } else {
                        info!(device_id = device.id, "api client login failed");
                        writer
                            .write_all(&encode_trap_sentence("invalid username or password"))
                            .await?;
                        break 'session;
                    }
                } else {
                    // Unauthenticated traffic never reaches the upstream.
                    debug!(device_id = device.id, "command before login, closing");
                    break 'session;
                }
            } else {
                let reply = dispatch(words, device, link, queue).await;
                writer.write_all(&reply).await?;
            }
        }
    }
    Ok(())
}

/// Decode the words of one raw sentence (terminator already stripped).
///
/// A truncated trailing word is tolerated and dropped; an unknown length
/// prefix is a framing error that ends the connection.
fn sentence_words(raw: &[u8]) -> Result<Vec<String>, FrameError> {
    let mut words = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        let Some((len, header)) = decode_length(&raw[i..])? else {
            break;
        };
        let start = i + header;
        let end = start + len as usize;
        if end > raw.len() {
            break;
        }
        words.push(String::from_utf8_lossy(&raw[start..end]).into_owned());
        i = end;
    }
    Ok(words)
}

fn login_matches(words: &[String], device: &DeviceConfig) -> bool {
    let name = words.iter().find_map(|w| w.strip_prefix("=name="));
    let password = words.iter().find_map(|w| w.strip_prefix("=password="));
    name == Some(device.user.as_str()) && password == Some(device.password.as_str())
}

// ---------------------------------------------------------------------------
// Authenticated dispatch
// ---------------------------------------------------------------------------

/// Decide a single sentence's fate and synthesize the client reply.
async fn dispatch<L: DeviceLink, Q: CommandSink>(
    words: Vec<String>,
    device: &DeviceConfig,
    link: &L,
    queue: &Q,
) -> Vec<u8> {
    if !link.is_connected() {
        return match queue.enqueue(device.id, &words).await {
            Ok(id) => {
                info!(
                    device_id = device.id,
                    queued_id = id,
                    "upstream down, command queued"
                );
                encode_done()
            }
            Err(e) => {
                warn!(device_id = device.id, error = %e, "enqueue failed with upstream down");
                encode_trap_reply("FATAL: Command could not be queued.")
            }
        };
    }

    // Exactly one inline attempt; durability is the queue's job.
    match link.run_command(words.clone()).await {
        Ok(rows) => encode_data_reply(&rows),
        Err(e) if e.is_trap() => {
            debug!(device_id = device.id, error = %e, "command refused by device");
            encode_trap_reply(&e.to_string())
        }
        Err(e) => match queue.enqueue(device.id, &words).await {
            Ok(id) => {
                info!(
                    device_id = device.id,
                    queued_id = id,
                    error = %e,
                    "command failed, queued for retry"
                );
                encode_trap_reply(&format!(
                    "Command failed but was queued for later. Error: {}",
                    e
                ))
            }
            Err(qe) => {
                warn!(device_id = device.id, error = %qe, "command failed and enqueue failed");
                encode_trap_reply("FATAL: Command failed and could not be queued.")
            }
        },
    }
}
