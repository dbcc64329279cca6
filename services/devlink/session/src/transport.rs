//! Byte transports for a link.
//!
//! A [`Link`](crate::Link) accepts any `AsyncRead + AsyncWrite` stream. This
//! module provides the two the command line uses: a USB CDC serial port and
//! a TCP connection to a serial bridge. Serial ports are opened raw, 8N1,
//! without flow control, so the line discipline never rewrites frame bytes.

use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits,
};
use tracing::debug;

/// Baud rate used when none is configured; CDC devices ignore it
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Unified stream type that can be either a serial device or a TCP bridge
pub enum IoStream {
    /// TCP connection to a serial bridge
    Tcp(TcpStream),
    /// Serial port in raw mode
    Serial(SerialStream),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Serial(port) => Pin::new(port).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Serial(port) => Pin::new(port).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Serial(port) => Pin::new(port).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Serial(port) => Pin::new(port).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Human-readable description of the endpoint
    pub fn describe(&self) -> String {
        match self {
            IoStream::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| format!("tcp://{}", addr))
                .unwrap_or_else(|_| "tcp://unknown".to_string()),
            IoStream::Serial(port) => match (port.name(), port.baud_rate()) {
                (Some(name), Ok(baud)) => format!("{} @ {} baud", name, baud),
                (Some(name), Err(_)) => name,
                (None, _) => "serial".to_string(),
            },
        }
    }
}

/// Open a serial port raw, 8N1, no flow control.
///
/// Fails for paths that are not terminals.
pub async fn open_device(path: impl AsRef<Path>, baud_rate: u32) -> tokio::io::Result<IoStream> {
    let path = path.as_ref();
    let port = tokio_serial::new(path.to_string_lossy(), baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(std::io::Error::from)?;
    debug!("Opened serial port {:?} at {} baud", path, baud_rate);
    Ok(IoStream::Serial(port))
}

/// Connect to a serial bridge over TCP
pub async fn connect_tcp(addr: impl ToSocketAddrs) -> tokio::io::Result<IoStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!("Connected to {:?}", stream.peer_addr());
    Ok(IoStream::Tcp(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_bridge_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut stream = connect_tcp(addr).await.unwrap();
        assert!(stream.describe().starts_with("tcp://127.0.0.1"));
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_device_fails() {
        assert!(open_device("/nonexistent/devlink-tty", DEFAULT_BAUD_RATE)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_open_regular_file_is_not_a_port() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(open_device(file.path(), DEFAULT_BAUD_RATE).await.is_err());
    }
}
