//! Async framed link over any byte stream.
//!
//! [`Link::spawn`] splits a stream into a [`LinkTx`] that writes framed
//! messages and a [`LinkRx`] fed by a background reader task.  The same code
//! runs over TCP in deployment and over [`tokio::io::duplex`] in tests and
//! the simulator.
//!
//! # Example
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use relume_link::Link;
//! use relume_types::{Command, ControllerReport, HostMessage};
//!
//! let (host_io, ctrl_io) = tokio::io::duplex(1024);
//! let (mut host_tx, _host_rx) = Link::spawn::<_, HostMessage, ControllerReport>(host_io);
//! let (_ctrl_tx, mut ctrl_rx) = Link::spawn::<_, ControllerReport, HostMessage>(ctrl_io);
//!
//! host_tx.send(&HostMessage { seq: 1, command: Command::Stop }).await.unwrap();
//! assert_eq!(ctrl_rx.recv().await.unwrap().seq, 1);
//! # }
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use relume_types::RelumeError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{FrameParser, decode_payload, encode_frame};

/// Messages buffered between the reader task and [`LinkRx`].
const CHANNEL_CAPACITY: usize = 256;

/// Counters shared between the reader task and [`LinkRx`].
#[derive(Debug, Default)]
pub struct LinkStats {
    frames: AtomicU64,
    checksum_failures: AtomicU64,
    decode_failures: AtomicU64,
}

impl LinkStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn checksum_failures(&self) -> u64 {
        self.checksum_failures.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

/// Entry point for building links.
pub struct Link;

impl Link {
    /// Split `stream` into a typed sender and receiver.
    ///
    /// `Out` is the message type written by this end, `In` the type read.
    /// Must be called inside a Tokio runtime.
    pub fn spawn<S, Out, In>(stream: S) -> (LinkTx<Out>, LinkRx<In>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        Out: Serialize,
        In: DeserializeOwned + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let stats = Arc::new(LinkStats::default());
        tokio::spawn(read_loop(reader, tx, Arc::clone(&stats)));
        (
            LinkTx {
                writer: Box::new(writer),
                _out: PhantomData,
            },
            LinkRx {
                rx,
                stats,
                closed: false,
            },
        )
    }
}

async fn read_loop<R, In>(mut reader: R, tx: mpsc::Sender<In>, stats: Arc<LinkStats>)
where
    R: AsyncRead + Unpin,
    In: DeserializeOwned,
{
    let mut parser = FrameParser::new();
    let mut buf = [0u8; 512];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                info!("link peer closed the stream");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "link read failed");
                return;
            }
        };
        let before = parser.checksum_failures();
        let payloads = parser.extend(&buf[..n]);
        let failed = parser.checksum_failures() - before;
        if failed > 0 {
            stats.checksum_failures.fetch_add(failed, Ordering::Relaxed);
            warn!(failed, total = parser.checksum_failures(), "frame checksum mismatch");
        }
        for payload in payloads {
            match decode_payload::<In>(&payload) {
                Ok(msg) => {
                    stats.frames.fetch_add(1, Ordering::Relaxed);
                    if tx.send(msg).await.is_err() {
                        debug!("link receiver dropped, stopping reader");
                        return;
                    }
                }
                Err(e) => {
                    stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, len = payload.len(), "dropping undecodable frame");
                }
            }
        }
    }
}

/// Sending half of a link.
pub struct LinkTx<Out> {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    _out: PhantomData<fn(Out)>,
}

impl<Out: Serialize> LinkTx<Out> {
    /// Frame and write one message.
    pub async fn send(&mut self, msg: &Out) -> Result<(), RelumeError> {
        let frame = encode_frame(msg)?;
        self.writer
            .write_all(&frame)
            .await
            .map_err(|e| RelumeError::Link(format!("write failed: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| RelumeError::Link(format!("flush failed: {e}")))
    }
}

impl<Out> std::fmt::Debug for LinkTx<Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkTx").finish_non_exhaustive()
    }
}

/// Receiving half of a link.
#[derive(Debug)]
pub struct LinkRx<In> {
    rx: mpsc::Receiver<In>,
    stats: Arc<LinkStats>,
    closed: bool,
}

impl<In> LinkRx<In> {
    /// Next message if one is already waiting.
    ///
    /// # Errors
    ///
    /// [`RelumeError::Link`] once the peer has closed and every buffered
    /// message has been read.
    pub fn try_recv(&mut self) -> Result<Option<In>, RelumeError> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.closed = true;
                Err(RelumeError::Link("link closed".to_string()))
            }
        }
    }

    /// Every message currently waiting, oldest first.
    pub fn drain(&mut self) -> Result<Vec<In>, RelumeError> {
        let mut out = Vec::new();
        loop {
            match self.try_recv() {
                Ok(Some(msg)) => out.push(msg),
                Ok(None) => return Ok(out),
                Err(e) if out.is_empty() => return Err(e),
                Err(_) => return Ok(out),
            }
        }
    }

    /// Wait for the next message; `None` after the peer has closed.
    pub async fn recv(&mut self) -> Option<In> {
        let msg = self.rx.recv().await;
        if msg.is_none() {
            self.closed = true;
        }
        msg
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }
}

/// Connect to a listening peer over TCP.
pub async fn connect(addr: impl ToSocketAddrs) -> Result<TcpStream, RelumeError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| RelumeError::Link(format!("connect failed: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| RelumeError::Link(format!("set_nodelay failed: {e}")))?;
    if let Ok(peer) = stream.peer_addr() {
        info!(%peer, "link connected");
    }
    Ok(stream)
}

/// Bind `addr` and accept a single peer.
pub async fn listen(addr: impl ToSocketAddrs) -> Result<TcpStream, RelumeError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RelumeError::Link(format!("bind failed: {e}")))?;
    if let Ok(local) = listener.local_addr() {
        info!(%local, "waiting for link peer");
    }
    accept(&listener).await
}

/// Accept one peer on an already-bound listener.
pub async fn accept(listener: &TcpListener) -> Result<TcpStream, RelumeError> {
    let (stream, peer) = listener
        .accept()
        .await
        .map_err(|e| RelumeError::Link(format!("accept failed: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| RelumeError::Link(format!("set_nodelay failed: {e}")))?;
    info!(%peer, "link peer accepted");
    Ok(stream)
}
