//! Framed stream endpoint over TCP or UNIX-domain sockets.
//!
//! The transport is chosen by port value: a non-positive port means the
//! address is a UDS path. All integers on the wire are big-endian 64-bit
//! two's complement.

use crate::errors::NetError;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::time::Duration;

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            Stream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(buf),
            Stream::Unix(s) => s.write_all(buf),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

/// Convert a timeout in seconds to a socket deadline.
///
/// Non-positive and unset values both mean "block indefinitely".
pub fn timeout_secs(secs: Option<f64>) -> Option<Duration> {
    secs.filter(|s| *s > 0.0).map(Duration::from_secs_f64)
}

/// A message-exchange endpoint for one peer.
pub struct Endpoint {
    address: String,
    port: i32,
    stream: Option<Stream>,
}

impl Endpoint {
    /// Create a closed endpoint for the given address.
    ///
    /// `port <= 0` selects a UNIX-domain socket at `address`.
    pub fn new<S: Into<String>>(address: S, port: i32) -> Endpoint {
        Endpoint {
            address: address.into(),
            port,
            stream: None,
        }
    }

    /// Wrap an already-accepted TCP connection.
    pub fn from_tcp<S: Into<String>>(stream: TcpStream, address: S, port: i32) -> Endpoint {
        Endpoint {
            address: address.into(),
            port,
            stream: Some(Stream::Tcp(stream)),
        }
    }

    /// Wrap an already-accepted UNIX-domain connection.
    pub fn from_unix<S: Into<String>>(stream: UnixStream, address: S) -> Endpoint {
        Endpoint {
            address: address.into(),
            port: 0,
            stream: Some(Stream::Unix(stream)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    /// The peer's `host:port` identity, as used in logs and the node list.
    pub fn peer_name(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Connect to the peer. A no-op when already open.
    pub fn open(&mut self, connect_timeout: Option<Duration>) -> Result<(), NetError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = if self.port <= 0 {
            Stream::Unix(UnixStream::connect(&self.address)?)
        } else {
            Stream::Tcp(self.connect_tcp(connect_timeout)?)
        };

        self.stream = Some(stream);
        Ok(())
    }

    fn connect_tcp(&self, connect_timeout: Option<Duration>) -> Result<TcpStream, NetError> {
        let addrs: Vec<_> = (self.address.as_str(), self.port as u16)
            .to_socket_addrs()?
            .collect();

        let timeout = match connect_timeout {
            None => {
                return TcpStream::connect((self.address.as_str(), self.port as u16))
                    .map_err(NetError::Io);
            }
            Some(t) => t,
        };

        let mut last = io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses to connect");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last = err,
            }
        }
        Err(NetError::Io(last))
    }

    /// Read exactly `size` bytes, coalescing partial reads.
    ///
    /// Fails with [`NetError::Closed`] when the peer shuts the connection
    /// and [`NetError::Timeout`] when the deadline elapses between chunks.
    pub fn read(&mut self, size: usize, read_timeout: Option<Duration>) -> Result<Vec<u8>, NetError> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        stream.set_read_timeout(read_timeout)?;

        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(NetError::Closed),
                Ok(n) => filled += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(NetError::Timeout);
                }
                Err(err) => return Err(NetError::Io(err)),
            }
        }
        Ok(buf)
    }

    /// Write all of `data`. Writes carry no deadline; they block until the
    /// kernel accepts the bytes or the connection faults.
    pub fn write(&mut self, data: &[u8]) -> Result<(), NetError> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        stream.write_all(data)?;
        Ok(())
    }

    pub fn read_i64(&mut self, read_timeout: Option<Duration>) -> Result<i64, NetError> {
        let bytes = self.read(8, read_timeout)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), NetError> {
        self.write(&value.to_be_bytes())
    }

    /// Close the connection. Safe to call on a closed endpoint.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown();
        }
    }
}

fn not_open() -> NetError {
    NetError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "endpoint is not open",
    ))
}
