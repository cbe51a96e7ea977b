//! Byte channel to the actuator controller board.
//!
//! The board speaks newline-terminated ASCII opcodes. [`SerialLink`] reaches
//! it either through a serial device opened at the configured baud rate or
//! through a network serial bridge given as `tcp://host:port`.
//! [`RecordingLink`] keeps everything in memory.

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open {endpoint}: {source}")]
    Open {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("link is not open")]
    NotOpen,

    #[error("link closed by peer")]
    Closed,

    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

#[async_trait]
pub trait ActuatorLink: Send {
    async fn open(&mut self) -> Result<(), LinkError>;

    fn is_open(&self) -> bool;

    /// Write one line; the terminator is appended here.
    async fn send_line(&mut self, line: &str) -> Result<(), LinkError>;

    /// Wait up to `timeout` for a response line. Timeouts are not errors.
    async fn read_response(&mut self, _timeout: Duration) -> Option<String> {
        None
    }

    async fn close(&mut self) -> Result<(), LinkError>;

    fn describe(&self) -> String;
}

trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Device(PathBuf),
    Tcp(String),
}

impl Endpoint {
    pub fn parse(port: &str) -> Self {
        match port.strip_prefix("tcp://") {
            Some(addr) => Endpoint::Tcp(addr.to_string()),
            None => Endpoint::Device(PathBuf::from(port)),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Device(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

pub struct SerialLink {
    endpoint: Endpoint,
    baud_rate: u32,
    applied_baud_rate: Option<u32>,
    conn: Option<BufReader<Box<dyn ByteStream>>>,
}

impl SerialLink {
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            endpoint: Endpoint::parse(port),
            baud_rate,
            applied_baud_rate: None,
            conn: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Line speed reported by the device after the last successful open.
    /// Always `None` for network bridges.
    pub fn applied_baud_rate(&self) -> Option<u32> {
        self.applied_baud_rate
    }

    fn open_device(&self, path: &std::path::Path) -> Result<SerialStream, LinkError> {
        let stream = tokio_serial::new(path.to_string_lossy(), self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| self.open_error(io::Error::from(e)))?;
        Ok(stream)
    }

    fn open_error(&self, source: io::Error) -> LinkError {
        LinkError::Open {
            endpoint: self.endpoint.to_string(),
            source,
        }
    }
}

#[async_trait]
impl ActuatorLink for SerialLink {
    async fn open(&mut self) -> Result<(), LinkError> {
        let stream: Box<dyn ByteStream> = match &self.endpoint {
            Endpoint::Device(path) => {
                let port = self.open_device(path)?;
                let applied = port.baud_rate().map_err(|e| self.open_error(e.into()))?;
                if applied != self.baud_rate {
                    return Err(self.open_error(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "device runs at {} baud, {} requested",
                            applied, self.baud_rate
                        ),
                    )));
                }
                self.applied_baud_rate = Some(applied);
                Box::new(port)
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|e| self.open_error(e))?;
                self.applied_baud_rate = None;
                Box::new(stream)
            }
        };

        info!(endpoint = %self.endpoint, baud = self.baud_rate, "actuator link opened");
        self.conn = Some(BufReader::new(stream));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    async fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        let conn = self.conn.as_mut().ok_or(LinkError::NotOpen)?;

        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');

        let result = match conn.write_all(framed.as_bytes()).await {
            Ok(()) => conn.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            // Any write failure leaves the board in an unknown position; drop
            // the connection so later requests see the link as unavailable.
            self.conn = None;
            return Err(match e.kind() {
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted => LinkError::Closed,
                _ => LinkError::Write(e),
            });
        }
        Ok(())
    }

    async fn read_response(&mut self, timeout: Duration) -> Option<String> {
        let conn = self.conn.as_mut()?;
        let mut line = String::new();
        match tokio::time::timeout(timeout, conn.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => Some(line.trim_end().to_string()),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                debug!(error = %e, "actuator response read failed");
                None
            }
            Err(_) => None,
        }
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.shutdown().await {
                warn!(endpoint = %self.endpoint, error = %e, "actuator link shutdown failed");
                return Err(LinkError::Write(e));
            }
            info!(endpoint = %self.endpoint, "actuator link closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.endpoint, self.baud_rate)
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    sent: Mutex<Vec<String>>,
    open: AtomicBool,
    unavailable: AtomicBool,
    fail_writes: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Shared view into a [`RecordingLink`], kept by whoever needs to inspect or
/// disturb the link after it has been handed to the coordinator.
#[derive(Debug, Clone, Default)]
pub struct LinkProbe {
    state: Arc<ProbeState>,
}

impl LinkProbe {
    pub fn sent(&self) -> Vec<String> {
        self.state
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.state
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Simulate the board disappearing: the next write reports the link closed.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }
}

/// In-memory link that records every line sent. Used for dry runs.
#[derive(Debug, Default)]
pub struct RecordingLink {
    probe: LinkProbe,
    refuse_open: bool,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A link whose `open` always fails.
    pub fn refusing() -> Self {
        Self {
            probe: LinkProbe::default(),
            refuse_open: true,
        }
    }

    pub fn probe(&self) -> LinkProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl ActuatorLink for RecordingLink {
    async fn open(&mut self) -> Result<(), LinkError> {
        if self.refuse_open {
            return Err(LinkError::Open {
                endpoint: self.describe(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
            });
        }
        self.probe.state.opens.fetch_add(1, Ordering::SeqCst);
        self.probe.state.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.probe.is_open()
    }

    async fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        let state = &self.probe.state;
        if !state.open.load(Ordering::SeqCst) {
            return Err(LinkError::NotOpen);
        }
        if state.unavailable.load(Ordering::SeqCst) {
            state.open.store(false, Ordering::SeqCst);
            return Err(LinkError::Closed);
        }
        if state.fail_writes.load(Ordering::SeqCst) {
            return Err(LinkError::Write(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        debug!(line, "recorded actuator line");
        state
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.probe.state.closes.fetch_add(1, Ordering::SeqCst);
        self.probe.state.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "recording link".to_string()
    }
}
