//! In-process controller emulator.
//!
//! Listens on a loopback port and speaks the ASCII/binary protocol of one
//! IcePAP or DEEP controller, with a small motion model behind it. Used by the
//! integration tests and for trying the client without hardware.
//!
//! ```
//! use icepap::emulator::Emulator;
//! use icepap::protocol::{ProtocolMode, ProtocolSettings};
//! use icepap::Controller;
//!
//! # tokio_test::block_on(async {
//! let emulator = Emulator::start(ProtocolMode::IcePap, &[1, 2]).await?;
//! let controller = Controller::connect("demo", &emulator.endpoint(), ProtocolSettings::default()).await?;
//! assert!(controller.is_alive().await?);
//! controller.close().await;
//! emulator.shutdown().await;
//! # Ok::<(), icepap::IcepapError>(())
//! # }).unwrap();
//! ```

mod device;

pub use device::{AxisSnapshot, DeviceState};

use crate::error::{IcepapError, Result};
use crate::protocol::binary::{self, HEADER_LEN};
use crate::protocol::ProtocolMode;
use crate::transport::{AsyncFrame, Endpoint};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Shared {
    frames: Vec<AsyncFrame>,
}

/// Emulated controller bound to `127.0.0.1`.
#[derive(Debug)]
pub struct Emulator {
    address: SocketAddr,
    state: Arc<Mutex<DeviceState>>,
    shared: Arc<Mutex<Shared>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Emulator {
    /// Start an emulator with axes at `addresses`.
    pub async fn start(mode: ProtocolMode, addresses: &[u16]) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.map_err(io_error)?;
        let address = listener.local_addr().map_err(io_error)?;
        info!(%address, ?mode, axes = addresses.len(), "emulator listening");

        let state = Arc::new(Mutex::new(DeviceState::new(mode, addresses)));
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            listener,
            mode,
            Arc::clone(&state),
            Arc::clone(&shared),
            shutdown_rx,
        ));

        Ok(Self {
            address,
            state,
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Socket address the emulator listens on.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Endpoint for [`Controller::connect`](crate::controller::Controller::connect).
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.address.ip().to_string(),
            port: self.address.port(),
            timeout: Endpoint::DEFAULT_TIMEOUT,
        }
    }

    /// Every command line received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Forget the recorded commands.
    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Number of status polls a motion lasts. Zero completes moves at once.
    pub fn set_motion_polls(&self, polls: u32) {
        self.state.lock().motion_polls = polls;
    }

    /// Acknowledge power requests on `address` without applying them.
    pub fn fail_power(&self, address: u16) {
        if let Some(axis) = self.state.lock().axes.get_mut(&address) {
            axis.power_fails = true;
        }
    }

    /// Override the parameter velocity of one axis.
    pub fn set_parameter_velocity(&self, address: u16, velocity: f64) {
        if let Some(axis) = self.state.lock().axes.get_mut(&address) {
            axis.parameter_velocity = velocity;
        }
    }

    /// Queue an async frame, written ahead of the next reply.
    pub fn inject_frame(&self, frame: AsyncFrame) {
        self.shared.lock().frames.push(frame);
    }

    /// Snapshot of one axis.
    pub fn axis(&self, address: u16) -> Option<AxisSnapshot> {
        self.state.lock().axes.get(&address).cloned()
    }

    /// Stop accepting and close every client connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn io_error(source: std::io::Error) -> IcepapError {
    IcepapError::Io {
        host: "emulator".to_string(),
        source,
    }
}

async fn accept_loop(
    listener: TcpListener,
    mode: ProtocolMode,
    state: Arc<Mutex<DeviceState>>,
    shared: Arc<Mutex<Shared>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let clients = shutdown.clone();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        let state = Arc::clone(&state);
                        let shared = Arc::clone(&shared);
                        let shutdown = clients.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(socket, mode, state, shared, shutdown).await {
                                warn!(%peer, error = %e, "emulator client error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "emulator accept error"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("emulator stopped");
}

async fn handle_client(
    socket: TcpStream,
    mode: ProtocolMode,
    state: Arc<Mutex<DeviceState>>,
    shared: Arc<Mutex<Shared>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read.map_err(io_error)?,
            _ = shutdown.changed() => break,
        };
        if read == 0 {
            break;
        }
        let command = line.trim_matches(|c| c == ' ' || c == '\n' || c == '\r');
        if command.is_empty() {
            continue;
        }

        let payload = if DeviceState::expects_payload(command) {
            let mut raw = [0u8; HEADER_LEN];
            reader.read_exact(&mut raw).await.map_err(io_error)?;
            let header = binary::decode_header(mode, &raw)
                .map_err(|message| IcepapError::protocol("emulator", command, message))?;
            let mut data = vec![0u8; header.payload_len()];
            reader.read_exact(&mut data).await.map_err(io_error)?;
            let block = binary::decode_payload(&header, data).map_err(|(expected, computed)| IcepapError::Checksum {
                host: "emulator".to_string(),
                command: command.to_string(),
                expected,
                computed,
            })?;
            Some(block)
        } else {
            None
        };

        let reply = state.lock().execute(command, payload);
        let frames = std::mem::take(&mut shared.lock().frames);
        for frame in frames {
            writer.write_all(&frame.to_wire()).await.map_err(io_error)?;
        }
        if let Some(reply) = reply {
            writer.write_all(reply.as_bytes()).await.map_err(io_error)?;
        }
        writer.flush().await.map_err(io_error)?;
    }
    Ok(())
}
