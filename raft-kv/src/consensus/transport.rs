//! TCP transport for Raft messages.
//!
//! Frames are length-prefixed:
//! - 4 bytes: frame length (big-endian u32)
//! - N bytes: bincode [`Envelope`] holding the sender's transport address and
//!   the protobuf-encoded raft `Message`
//!
//! Carrying the sender's address lets a receiver reach a peer it has only
//! heard from, which is how a freshly joined member learns where its leader
//! lives before any snapshot arrives.
//!
//! Each peer gets one outbound thread that owns a persistent connection and
//! reconnects on error. Frames for an unreachable peer are dropped; raft
//! retransmits whatever matters.

use std::collections::HashMap;
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const ACCEPT_POLL: Duration = Duration::from_millis(20);
const READ_POLL: Duration = Duration::from_millis(200);
const OUTBOUND_QUEUE: usize = 1024;
const MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from_addr: String,
    message: Vec<u8>,
}

/// A message read off the wire, with the address its sender listens on.
#[derive(Debug)]
pub struct Incoming {
    pub from_addr: String,
    pub message: Message,
}

pub fn encode_frame(from_addr: &str, msg: &Message) -> Result<Vec<u8>> {
    let envelope = Envelope {
        from_addr: from_addr.to_string(),
        message: msg.encode_to_vec(),
    };
    let body = bincode::serialize(&envelope).context("encode envelope")?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<Incoming>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(anyhow!("frame of {len} bytes exceeds limit"));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let envelope: Envelope = bincode::deserialize(&buf).context("decode envelope")?;
    let message = Message::decode(envelope.message.as_slice()).context("decode raft message")?;
    Ok(Some(Incoming {
        from_addr: envelope.from_addr,
        message,
    }))
}

/// Listener plus per-peer senders for one node.
pub struct Transport {
    local_addr: String,
    outbound: HashMap<String, Sender<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
}

impl Transport {
    /// Binds `addr` and starts accepting peers. Every decoded message is
    /// forwarded to `inbound`.
    ///
    /// Binding happens before this returns, so a port conflict is reported
    /// to the caller rather than lost in a background thread.
    pub fn bind(addr: &str, inbound: Sender<Incoming>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("failed to bind raft transport {addr}"))?;
        listener
            .set_nonblocking(true)
            .context("set listener nonblocking")?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = shutdown.clone();
        thread::Builder::new()
            .name(format!("raft-net-listener-{addr}"))
            .spawn(move || accept_loop(listener, inbound, flag))
            .context("failed to spawn network listener")?;

        debug!(addr, "raft transport listening");
        Ok(Self {
            local_addr: addr.to_string(),
            outbound: HashMap::new(),
            shutdown,
        })
    }

    /// Queues `msg` for the peer at `addr`, starting its sender on first use.
    pub fn send(&mut self, addr: &str, msg: &Message) -> Result<()> {
        let frame = encode_frame(&self.local_addr, msg)?;
        let tx = match self.outbound.get(addr) {
            Some(tx) => tx.clone(),
            None => {
                let tx = spawn_peer_sender(addr.to_string())?;
                self.outbound.insert(addr.to_string(), tx.clone());
                tx
            }
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(peer = addr, "outbound queue full, dropping message");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.outbound.remove(addr);
            }
        }
        Ok(())
    }

    /// Stops accepting connections and releases every peer sender.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.outbound.clear();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, inbound: Sender<Incoming>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let (inbound, shutdown) = (inbound.clone(), shutdown.clone());
                let spawned = thread::Builder::new()
                    .name(format!("raft-net-conn-{peer}"))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, inbound, shutdown) {
                            debug!(%peer, error = %err, "raft connection closed");
                        }
                    });
                if let Err(err) = spawned {
                    warn!(%peer, error = %err, "failed to spawn connection handler");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                warn!(error = %err, "accept error");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("raft listener stopped");
}

/// Reads frames off one connection until the peer hangs up.
fn handle_connection(
    stream: TcpStream,
    inbound: Sender<Incoming>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    // Wake up periodically to notice shutdown on idle connections.
    stream.set_read_timeout(Some(READ_POLL))?;
    let mut reader = BufReader::new(stream);
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !wait_readable(&mut reader)? {
            continue;
        }
        // Once data is flowing, read the whole frame without the poll timeout.
        reader.get_ref().set_read_timeout(None)?;
        let frame = read_frame(&mut reader);
        reader.get_ref().set_read_timeout(Some(READ_POLL))?;
        match frame? {
            Some(incoming) => {
                trace!(from = incoming.message.from, to = incoming.message.to, "received");
                if inbound.send(incoming).is_err() {
                    return Ok(());
                }
            }
            None => return Ok(()),
        }
    }
}

/// Waits up to the read timeout for buffered data. `false` means nothing
/// arrived yet.
fn wait_readable(reader: &mut BufReader<TcpStream>) -> Result<bool> {
    use std::io::BufRead;
    match reader.fill_buf() {
        // An empty buffer after a successful fill is end of stream; let
        // read_frame report it.
        Ok(_) => Ok(true),
        Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

fn spawn_peer_sender(addr: String) -> Result<Sender<Vec<u8>>> {
    let (tx, rx) = bounded(OUTBOUND_QUEUE);
    thread::Builder::new()
        .name(format!("raft-net-sender-{addr}"))
        .spawn(move || peer_sender_loop(&addr, rx))
        .context("failed to spawn peer sender")?;
    Ok(tx)
}

/// Delivers queued frames to one peer until the queue's sender is dropped.
fn peer_sender_loop(addr: &str, rx: Receiver<Vec<u8>>) {
    let mut stream: Option<TcpStream> = None;
    for frame in rx {
        if stream.is_none() {
            match connect(addr) {
                Ok(conn) => stream = Some(conn),
                Err(err) => {
                    debug!(peer = addr, error = %err, "peer unreachable, dropping message");
                    continue;
                }
            }
        }
        if let Some(conn) = stream.as_mut() {
            if let Err(err) = conn.write_all(&frame) {
                debug!(peer = addr, error = %err, "send failed, reconnecting");
                stream = None;
            }
        }
    }
}

fn connect(addr: &str) -> io::Result<TcpStream> {
    let resolved: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}"));
    for candidate in resolved {
        match TcpStream::connect_timeout(&candidate, CONNECT_TIMEOUT) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}
