//! TCP byte channel with a background receiver task.
//!
//! The receiver owns the read half of the socket and runs every inbound byte
//! through [`FrameDemux`]. Synchronous bytes land in a FIFO consumed by
//! foreground readers; async frames are published on a broadcast channel.

use super::demux::{AsyncFrame, FrameDemux};
use crate::error::{IcepapError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// Writer half of the connection.
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const FRAME_CHANNEL_CAPACITY: usize = 64;
const READ_CHUNK: usize = 4096;

/// Controller network address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Default reply timeout.
    pub timeout: Duration,
}

impl Endpoint {
    /// Default controller TCP port.
    pub const DEFAULT_PORT: u16 = 5000;
    /// Default reply timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    /// Parse `host[:port]`, applying `default_port` when the port is absent.
    pub fn parse(text: &str, default_port: u16, timeout: Duration) -> Result<Self> {
        let text = text.trim();
        let bad_port = || IcepapError::InvalidOption(format!("bad port in endpoint \"{}\"", text));
        let (host, port) = if let Some(rest) = text.strip_prefix('[') {
            // Bracketed IPv6 literal, e.g. "[::1]:5000".
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| IcepapError::InvalidOption(format!("unclosed '[' in endpoint \"{}\"", text)))?;
            let port = match tail {
                "" => default_port,
                _ => tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse::<u16>().ok())
                    .ok_or_else(bad_port)?,
            };
            (host, port)
        } else {
            match text.rsplit_once(':') {
                // More than one colon: a bare IPv6 literal without port.
                Some((host, _)) if host.contains(':') => (text, default_port),
                Some((host, port)) => (host, port.parse::<u16>().map_err(|_| bad_port())?),
                None => (text, default_port),
            }
        };
        if host.is_empty() {
            return Err(IcepapError::InvalidOption(format!("missing host in endpoint \"{}\"", text)));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            timeout,
        })
    }

    /// `host:port` form, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Synchronous-stream FIFO shared by the receiver and foreground readers.
///
/// Single producer, many consumers. Bytes are handed out strictly in arrival
/// order. After close, readers may still consume what was buffered; reads that
/// cannot be satisfied then fail with `ConnectionClosed`.
#[derive(Debug, Default)]
struct SyncFifo {
    state: Mutex<FifoState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct FifoState {
    data: VecDeque<u8>,
    closed: bool,
}

impl SyncFifo {
    fn push(&self, bytes: &[u8]) {
        self.state.lock().data.extend(bytes);
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.data.len();
        state.data.clear();
        n
    }

    /// Wait until `take` returns `Some`, the FIFO closes, or `deadline` passes.
    ///
    /// Returns `Ok(None)` on deadline and `Err(())` when closed and unsatisfiable.
    async fn wait_for<T>(
        &self,
        deadline: Instant,
        mut take: impl FnMut(&mut VecDeque<u8>) -> Option<T>,
    ) -> std::result::Result<Option<T>, ()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(value) = take(&mut state.data) {
                    return Ok(Some(value));
                }
                if state.closed {
                    return Err(());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

/// Duplex byte channel to one controller.
#[derive(Debug)]
pub struct TransportChannel {
    host: String,
    writer: tokio::sync::Mutex<Option<WriterSlot>>,
    fifo: Arc<SyncFifo>,
    frames: broadcast::Sender<AsyncFrame>,
    shutdown: watch::Sender<bool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    dirty: AtomicBool,
}

struct WriterSlot(BoxedWriter);

impl std::fmt::Debug for WriterSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WriterSlot")
    }
}

impl TransportChannel {
    /// Connect to `endpoint`, failing with `Connection` after `endpoint.timeout`.
    #[instrument(skip_all, fields(endpoint = %endpoint.address()), err)]
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let address = endpoint.address();
        let stream = match tokio::time::timeout(endpoint.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(IcepapError::Connection { endpoint: address, source }),
            Err(_) => {
                return Err(IcepapError::Connection {
                    endpoint: address,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|source| IcepapError::Connection { endpoint: address.clone(), source })?;
        debug!("connected");
        Ok(Self::from_stream(&endpoint.host, stream))
    }

    /// Wrap an already-open stream and start the receiver task.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_stream<S>(host: &str, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let fifo = Arc::new(SyncFifo::default());
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(receive_loop(
            host.to_string(),
            reader,
            Arc::clone(&fifo),
            frames.clone(),
            shutdown_rx,
        ));

        Self {
            host: host.to_string(),
            writer: tokio::sync::Mutex::new(Some(WriterSlot(Box::new(writer)))),
            fifo,
            frames,
            shutdown,
            receiver: Mutex::new(Some(handle)),
            dirty: AtomicBool::new(false),
        }
    }

    /// Controller hostname.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Subscribe to decoded async frames.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<AsyncFrame> {
        self.frames.subscribe()
    }

    /// Write `parts` back to back under the send lock.
    ///
    /// Concurrent senders never interleave: all parts of one call are written
    /// before another call acquires the lock.
    pub async fn send(&self, parts: &[&[u8]]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(WriterSlot(writer)) = guard.as_mut() else {
            return Err(IcepapError::ConnectionClosed { host: self.host.clone() });
        };
        for part in parts {
            if let Err(source) = writer.write_all(part).await {
                self.mark_dirty();
                return Err(IcepapError::Io { host: self.host.clone(), source });
            }
        }
        if let Err(source) = writer.flush().await {
            self.mark_dirty();
            return Err(IcepapError::Io { host: self.host.clone(), source });
        }
        Ok(())
    }

    /// Read exactly `n` synchronous bytes.
    pub async fn read_sync(&self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let outcome = self
            .fifo
            .wait_for(deadline, |data| {
                if data.len() >= n {
                    Some(data.drain(..n).collect::<Vec<u8>>())
                } else {
                    None
                }
            })
            .await;
        self.finish_read(outcome, timeout)
    }

    /// Read one line, without its `\n` terminator and any trailing `\r`.
    pub async fn read_line(&self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let outcome = self
            .fifo
            .wait_for(deadline, |data| {
                let end = data.iter().position(|&b| b == b'\n')?;
                let mut line: Vec<u8> = data.drain(..=end).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Some(line)
            })
            .await;
        let line = self.finish_read(outcome, timeout)?;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    fn finish_read<T>(&self, outcome: std::result::Result<Option<T>, ()>, timeout: Duration) -> Result<T> {
        match outcome {
            Ok(Some(value)) => Ok(value),
            Ok(None) => {
                self.mark_dirty();
                Err(IcepapError::Timeout {
                    host: self.host.clone(),
                    command: String::new(),
                    timeout,
                })
            }
            Err(()) => {
                self.mark_dirty();
                Err(IcepapError::ConnectionClosed { host: self.host.clone() })
            }
        }
    }

    /// Discard buffered synchronous bytes until the line has been quiet for `quiet`.
    ///
    /// Gives up after `max_wait` even if bytes keep arriving. Clears the dirty flag.
    /// Returns the number of bytes discarded.
    pub async fn drain(&self, quiet: Duration, max_wait: Duration) -> usize {
        let hard_deadline = Instant::now() + max_wait;
        let mut total = self.fifo.clear();
        loop {
            let deadline = (Instant::now() + quiet).min(hard_deadline);
            match self
                .fifo
                .wait_for(deadline, |data| {
                    if data.is_empty() {
                        None
                    } else {
                        let n = data.len();
                        data.clear();
                        Some(n)
                    }
                })
                .await
            {
                Ok(Some(n)) => total += n,
                Ok(None) | Err(()) => break,
            }
            if Instant::now() >= hard_deadline {
                break;
            }
        }
        self.dirty.store(false, Ordering::SeqCst);
        if total > 0 {
            debug!(host = %self.host, discarded = total, "drained stale bytes");
        }
        total
    }

    /// Flag the channel as holding stale bytes.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Whether the next command must drain first.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Stop the receiver, shut the socket down and wait for the task to exit.
    ///
    /// Idempotent. Buffered synchronous bytes remain readable afterwards.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        if let Some(WriterSlot(mut writer)) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(host = %self.host, error = %e, "receiver task ended abnormally");
            }
            debug!(host = %self.host, "channel closed");
        }
        self.fifo.close();
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.receiver.lock().take() {
            handle.abort();
        }
    }
}

async fn receive_loop<R>(
    host: String,
    mut reader: R,
    fifo: Arc<SyncFifo>,
    frames: broadcast::Sender<AsyncFrame>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut demux = FrameDemux::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut sync = Vec::with_capacity(READ_CHUNK);
    let mut decoded = Vec::new();

    debug!(host = %host, "receiver started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(host = %host, "peer closed connection");
                    break;
                }
                Ok(n) => {
                    demux.feed(&buf[..n], &mut sync, &mut decoded);
                    if !sync.is_empty() {
                        trace!(host = %host, bytes = sync.len(), "<=== sync bytes");
                        fifo.push(&sync);
                        sync.clear();
                    }
                    for frame in decoded.drain(..) {
                        debug!(host = %host, frame = frame.frame_number, words = frame.length_words, "async frame");
                        // No subscribers is not an error.
                        let _ = frames.send(frame);
                    }
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "socket read failed");
                    break;
                }
            }
        }
    }
    if !demux.is_idle() {
        debug!(host = %host, "receiver stopped mid-frame");
    }
    fifo.close();
    debug!(host = %host, "receiver finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        let ep = Endpoint::parse("iceid001:5001", 5000, Endpoint::DEFAULT_TIMEOUT).unwrap();
        assert_eq!(ep.host, "iceid001");
        assert_eq!(ep.port, 5001);

        let ep = Endpoint::parse("iceid001", 5000, Endpoint::DEFAULT_TIMEOUT).unwrap();
        assert_eq!(ep.port, 5000);
        assert_eq!(ep.address(), "iceid001:5000");

        assert!(Endpoint::parse("iceid001:xx", 5000, Endpoint::DEFAULT_TIMEOUT).is_err());
        assert!(Endpoint::parse(":5000", 5000, Endpoint::DEFAULT_TIMEOUT).is_err());
    }

    #[test]
    fn ipv6_endpoints() {
        let ep = Endpoint::parse("[::1]:5001", 5000, Endpoint::DEFAULT_TIMEOUT).unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 5001);
        assert_eq!(ep.address(), "[::1]:5001");

        let ep = Endpoint::parse("[fe80::2]", 5000, Endpoint::DEFAULT_TIMEOUT).unwrap();
        assert_eq!((ep.host.as_str(), ep.port), ("fe80::2", 5000));

        let ep = Endpoint::parse("::1", 5000, Endpoint::DEFAULT_TIMEOUT).unwrap();
        assert_eq!(ep.address(), "[::1]:5000");

        assert!(Endpoint::parse("[::1", 5000, Endpoint::DEFAULT_TIMEOUT).is_err());
        assert!(Endpoint::parse("[::1]5000", 5000, Endpoint::DEFAULT_TIMEOUT).is_err());
        assert!(Endpoint::parse("[]:5000", 5000, Endpoint::DEFAULT_TIMEOUT).is_err());
    }

    #[tokio::test]
    async fn lines_and_frames_are_separated() {
        let (mut device, host_side) = tokio::io::duplex(256);
        let channel = TransportChannel::from_stream("test", host_side);
        let mut frames = channel.subscribe_frames();

        let frame = AsyncFrame::new(1, &[9, 9]);
        let mut bytes = b"?POS 10\r\n".to_vec();
        bytes.extend(frame.to_wire());
        bytes.extend_from_slice(b"?POS 11\n");
        device.write_all(&bytes).await.unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(channel.read_line(timeout).await.unwrap(), "?POS 10");
        assert_eq!(channel.read_line(timeout).await.unwrap(), "?POS 11");
        assert_eq!(frames.recv().await.unwrap(), frame);
        channel.close().await;
    }

    #[tokio::test]
    async fn send_reaches_peer() {
        let (mut device, host_side) = tokio::io::duplex(64);
        let channel = TransportChannel::from_stream("test", host_side);
        channel.send(&[&b"?POS"[..], &b" 1\n"[..]]).await.unwrap();

        let mut buf = [0u8; 7];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"?POS 1\n");
    }

    #[tokio::test]
    async fn timeout_marks_dirty_and_drain_clears() {
        let (mut device, host_side) = tokio::io::duplex(64);
        let channel = TransportChannel::from_stream("test", host_side);

        let err = channel.read_line(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, IcepapError::Timeout { .. }));
        assert!(channel.is_dirty());

        device.write_all(b"late answer\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let discarded = channel
            .drain(Duration::from_millis(20), Duration::from_millis(200))
            .await;
        assert_eq!(discarded, 12);
        assert!(!channel.is_dirty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_keeps_buffered_bytes() {
        let (mut device, host_side) = tokio::io::duplex(64);
        let channel = TransportChannel::from_stream("test", host_side);
        device.write_all(b"abc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.close().await;
        channel.close().await;

        let bytes = channel.read_sync(3, Duration::from_millis(50)).await.unwrap();
        assert_eq!(bytes, b"abc");
        let err = channel.read_sync(1, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, IcepapError::ConnectionClosed { .. }));
        assert!(channel.send(&[&b"x"[..]]).await.is_err());
    }

    #[tokio::test]
    async fn peer_close_fails_pending_reader() {
        let (device, host_side) = tokio::io::duplex(64);
        let channel = TransportChannel::from_stream("test", host_side);
        drop(device);
        let err = channel.read_line(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, IcepapError::ConnectionClosed { .. }));
    }
}
