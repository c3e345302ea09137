//! Byte and line transports for the live adapters.
//!
//! The Arduino and DLS analyzer hang off serial ports, the gantry controller
//! speaks a telnet-style line protocol over TCP. All three adapters only need
//! to write a request and wait for the first non-empty reply line, so they
//! share the [`LineTransport`] trait. [`StreamTransport`] implements it for
//! any tokio byte stream.

use crate::error::{AppResult, RigError};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Request/reply channel to one device.
#[async_trait]
pub trait LineTransport: Send {
    /// Write raw bytes and flush.
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Wait for the next non-empty line, trimmed.
    ///
    /// Returns `Ok(None)` when nothing arrived within `timeout`.
    async fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;
}

/// [`LineTransport`] over a buffered tokio stream.
pub struct StreamTransport<S> {
    stream: BufReader<S>,
}

/// Telnet-style connection to the gantry controller.
pub type TcpTransport = StreamTransport<TcpStream>;

/// Serial connection (Arduino, DLS analyzer).
#[cfg(feature = "instrument_serial")]
pub type SerialTransport = StreamTransport<tokio_serial::SerialStream>;

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }
}

impl TcpTransport {
    /// Connect to `host:port`, failing after `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> AppResult<Self> {
        let addr = format!("{host}:{port}");
        debug!(%addr, "Connecting");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| RigError::Timeout {
                device: addr.clone(),
                timeout,
            })??;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[cfg(feature = "instrument_serial")]
impl SerialTransport {
    /// Open a serial port at 8N1 without flow control.
    pub fn open(port: &str, baud_rate: u32) -> AppResult<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e))?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl<S> LineTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        trace!(bytes = data.len(), "Writing request");
        let inner = self.stream.get_mut();
        inner.write_all(data).await?;
        inner.flush().await
    }

    async fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout_at(deadline, self.stream.read_line(&mut line)).await;
            match read {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "device closed the connection",
                    ))
                }
                Ok(Ok(_)) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        return Ok(Some(trimmed.to_string()));
                    }
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}

/// Where a live adapter connects to.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    /// Serial port
    Serial {
        /// Port name
        port: String,
        /// Baud rate
        baud_rate: u32,
    },
    /// TCP host and port
    Tcp {
        /// Host name or IP
        host: String,
        /// TCP port
        port: u16,
    },
}

impl Endpoint {
    /// Open the connection.
    pub async fn connect(&self, timeout: Duration) -> AppResult<Box<dyn LineTransport>> {
        match self {
            Endpoint::Tcp { host, port } => {
                Ok(Box::new(TcpTransport::connect(host, *port, timeout).await?))
            }
            #[cfg(feature = "instrument_serial")]
            Endpoint::Serial { port, baud_rate } => {
                Ok(Box::new(SerialTransport::open(port, *baud_rate)?))
            }
            #[cfg(not(feature = "instrument_serial"))]
            Endpoint::Serial { .. } => Err(RigError::SerialFeatureDisabled),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Serial { port, baud_rate } => write!(f, "{port}@{baud_rate}"),
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// A device's connection, opened on `initialize` and held until shutdown.
///
/// Requests are serialized: a reply is always read by the caller that wrote
/// the request.
pub struct DeviceLink {
    device: String,
    endpoint: Option<Endpoint>,
    transport: Mutex<Option<Box<dyn LineTransport>>>,
}

impl DeviceLink {
    /// A link that connects to `endpoint` on [`DeviceLink::open`].
    pub fn new(device: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            device: device.into(),
            endpoint: Some(endpoint),
            transport: Mutex::new(None),
        }
    }

    /// A link over an already connected transport.
    pub fn connected(device: impl Into<String>, transport: Box<dyn LineTransport>) -> Self {
        Self {
            device: device.into(),
            endpoint: None,
            transport: Mutex::new(Some(transport)),
        }
    }

    /// Device name used in errors.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Connect if not already connected.
    pub async fn open(&self, timeout: Duration) -> AppResult<()> {
        let mut guard = self.transport.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let endpoint = self.endpoint.as_ref().ok_or_else(|| {
            RigError::request_failed(&self.device, "no endpoint configured")
        })?;
        debug!(device = %self.device, %endpoint, "Opening device link");
        *guard = Some(endpoint.connect(timeout).await?);
        Ok(())
    }

    /// Write `request` and return the first non-empty reply line.
    pub async fn request(&self, request: &[u8], timeout: Duration) -> AppResult<String> {
        let mut guard = self.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| RigError::request_failed(&self.device, "not connected"))?;

        transport.write(request).await?;
        transport
            .read_line(timeout)
            .await?
            .ok_or_else(|| RigError::Timeout {
                device: self.device.clone(),
                timeout,
            })
    }

    /// Whether the link is open.
    pub async fn is_open(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    /// Drop the connection.
    pub async fn close(&self) {
        if self.transport.lock().await.take().is_some() {
            debug!(device = %self.device, "Device link closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_line_skips_blank_lines() {
        let (client, mut device) = duplex(64);
        let mut transport = StreamTransport::new(client);

        device.write_all(b"\r\n\nMotor1 Home Finished\r\n").await.unwrap();
        let line = transport
            .read_line(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(line.as_deref(), Some("Motor1 Home Finished"));
    }

    #[tokio::test]
    async fn test_read_line_times_out() {
        let (client, _device) = duplex(64);
        let mut transport = StreamTransport::new(client);

        let line = transport.read_line(Duration::from_millis(20)).await.unwrap();
        assert!(line.is_none());
    }

    #[tokio::test]
    async fn test_read_line_reports_closed_peer() {
        let (client, device) = duplex(64);
        let mut transport = StreamTransport::new(client);
        drop(device);

        let err = transport
            .read_line(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[cfg(not(feature = "instrument_serial"))]
    #[tokio::test]
    async fn test_serial_endpoint_requires_feature() {
        let endpoint = Endpoint::Serial {
            port: "/dev/ttyACM0".into(),
            baud_rate: 9600,
        };
        assert!(matches!(
            endpoint.connect(Duration::from_millis(10)).await,
            Err(RigError::SerialFeatureDisabled)
        ));
    }
}
