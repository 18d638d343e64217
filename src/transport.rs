//! Request/response transport to the drive controller.
//!
//! One request is in flight at a time: send a frame, then block for a single
//! read of at most [`RESPONSE_SIZE`] bytes. Retry belongs to the caller.

use crate::error::{DriveError, Result};
use crate::frame::RESPONSE_SIZE;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

/// Synchronous request/response channel to one controller.
pub trait Transport: Send {
    /// Send `frame` and return the raw response.
    fn send_and_receive(&mut self, frame: &[u8]) -> Result<Vec<u8>>;

    /// Close the connection. Further exchanges fail with [`DriveError::Disconnected`].
    fn close(&mut self);
}

/// Factory for fresh transports, used on startup and on every reconnect.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Transport>>;

    /// Human-readable peer description for logs.
    fn describe(&self) -> String;
}

/// Socket timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSettings {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
        }
    }
}

/// TCP connection to a dryve controller.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Open a connection to `host:port`.
    pub fn connect(host: &str, port: u16, settings: TcpSettings) -> Result<Self> {
        let context = format!("connect {}:{}", host, port);
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| DriveError::io(context.clone(), e))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, settings.connect_timeout) {
                Ok(stream) => {
                    let setup = stream
                        .set_read_timeout(Some(settings.io_timeout))
                        .and_then(|_| stream.set_write_timeout(Some(settings.io_timeout)))
                        .and_then(|_| stream.set_nodelay(true));
                    setup.map_err(|e| DriveError::io(context.clone(), e))?;
                    debug!("Connected to drive at {}", addr);
                    return Ok(Self {
                        stream: Some(stream),
                        peer: addr,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(DriveError::io(
            context,
            last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
            }),
        ))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn send_and_receive(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(DriveError::Disconnected)?;

        stream
            .write_all(frame)
            .map_err(|e| DriveError::io("send", e))?;

        let mut buf = [0u8; RESPONSE_SIZE];
        let n = stream.read(&mut buf).map_err(|e| DriveError::io("recv", e))?;
        if n == 0 {
            return Err(DriveError::io(
                "recv",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed by drive"),
            ));
        }

        let response = buf[..n].to_vec();
        trace!(tx = ?frame, rx = ?response, "frame exchange");
        Ok(response)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("Closed connection to {}", self.peer);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connects to a fixed `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    pub settings: TcpSettings,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, settings: TcpSettings) -> Self {
        Self {
            host: host.into(),
            port,
            settings,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> Result<Box<dyn Transport>> {
        let transport = TcpTransport::connect(&self.host, self.port, self.settings)?;
        Ok(Box::new(transport))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_tcp_request_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).unwrap();
            let mut reply = buf[..n].to_vec();
            reply.extend_from_slice(&[0x27, 0x06]);
            sock.write_all(&reply).unwrap();
        });

        let mut transport =
            TcpTransport::connect("127.0.0.1", port, TcpSettings::default()).unwrap();
        let request = crate::frame::statusword_request();
        let response = transport.send_and_receive(&request).unwrap();
        assert_eq!(response.len(), request.len() + 2);
        assert_eq!(crate::frame::decode_statusword(&response), Some(0x0627));

        transport.close();
        assert!(matches!(
            transport.send_and_receive(&request),
            Err(DriveError::Disconnected)
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpConnector::new("127.0.0.1", port, TcpSettings::default())
            .connect()
            .err()
            .unwrap();
        assert!(err.is_connection());
    }
}
