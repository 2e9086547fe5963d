//! Threaded TCP/UDS connection listener.

use crate::endpoint::Endpoint;
use crate::errors::NetError;
use crate::messaging::ACCEPT_BACKOFF;
use log::{debug, error, info};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use std::fs;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Callback invoked on its own thread for every accepted connection.
pub type ConnHandler = dyn Fn(Endpoint, String, i32) + Send + Sync;

enum ListenSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

struct Inner {
    socket: Option<Arc<ListenSocket>>,
    thread: Option<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
    bound_port: Option<u16>,
}

/// Accepts connections on one TCP or UDS socket and hands each to a
/// handler thread. `port <= 0` selects a UNIX-domain socket at `address`.
pub struct Listener {
    address: String,
    port: i32,
    handler: Arc<ConnHandler>,
    inner: Mutex<Inner>,
}

impl Listener {
    pub fn new<S, F>(address: S, port: i32, handler: F) -> Listener
    where
        S: Into<String>,
        F: Fn(Endpoint, String, i32) + Send + Sync + 'static,
    {
        Listener {
            address: address.into(),
            port,
            handler: Arc::new(handler),
            inner: Mutex::new(Inner {
                socket: None,
                thread: None,
                stopping: Arc::new(AtomicBool::new(false)),
                bound_port: None,
            }),
        }
    }

    /// Bind the socket and start the accept thread. Idempotent.
    pub fn start(&self) -> Result<(), NetError> {
        let mut inner = self.inner.lock();
        if inner.socket.is_some() {
            return Ok(());
        }

        let socket = if self.port <= 0 {
            // A previous run may have left its inode behind.
            let _ = fs::remove_file(&self.address);
            ListenSocket::Unix(UnixListener::bind(&self.address)?)
        } else {
            ListenSocket::Tcp(self.bind_tcp()?)
        };

        if let ListenSocket::Tcp(ref listener) = socket {
            inner.bound_port = Some(listener.local_addr()?.port());
        }

        let socket = Arc::new(socket);
        let stopping = Arc::new(AtomicBool::new(false));
        let handler = self.handler.clone();
        let address = self.address.clone();
        let port = self.port;

        inner.socket = Some(socket.clone());
        inner.stopping = stopping.clone();
        inner.thread = Some(thread::spawn(move || {
            accept_loop(&socket, &handler, &stopping, &address, port)
        }));

        Ok(())
    }

    fn bind_tcp(&self) -> Result<TcpListener, NetError> {
        let addr = (self.address.as_str(), self.port as u16)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| NetError::Protocol(format!("cannot resolve {}", self.address)))?;

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        Ok(socket.into())
    }

    /// The port actually bound, once started. Meaningful when TCP port 0
    /// was requested and the kernel picked one.
    pub fn bound_port(&self) -> Option<u16> {
        self.inner.lock().bound_port
    }

    /// Close the socket, stop the accept thread and remove a UDS inode.
    pub fn stop(&self) {
        let (socket, thread) = {
            let mut inner = self.inner.lock();
            inner.stopping.store(true, Ordering::SeqCst);
            (inner.socket.take(), inner.thread.take())
        };

        if socket.is_some() {
            self.wake_accept();
        }
        if let Some(thread) = thread {
            let _ = thread.join();
        }
        drop(socket);

        if self.port <= 0 {
            let _ = fs::remove_file(&self.address);
        }
    }

    // Unblock a pending accept with a throwaway connection.
    fn wake_accept(&self) {
        if self.port <= 0 {
            let _ = UnixStream::connect(&self.address);
        } else if let Some(port) = self.bound_port() {
            let address = match self.address.as_str() {
                "0.0.0.0" | "::" => "127.0.0.1",
                other => other,
            };
            let _ = TcpStream::connect((address, port));
        }
    }

    /// Block until the accept thread exits.
    pub fn join(&self) {
        let thread = self.inner.lock().thread.take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

fn accept_loop(
    socket: &ListenSocket,
    handler: &Arc<ConnHandler>,
    stopping: &AtomicBool,
    address: &str,
    port: i32,
) {
    info!("listening to network at {}:{}...", address, port);

    while !stopping.load(Ordering::SeqCst) {
        let accepted = match socket {
            ListenSocket::Tcp(listener) => listener.accept().map(|(stream, peer)| {
                let addr = peer.ip().to_string();
                let peer_port = i32::from(peer.port());
                (Endpoint::from_tcp(stream, addr.clone(), peer_port), addr, peer_port)
            }),
            ListenSocket::Unix(listener) => listener.accept().map(|(stream, _)| {
                (Endpoint::from_unix(stream, address), address.to_string(), 0)
            }),
        };

        match accepted {
            Ok((endpoint, peer_addr, peer_port)) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                let handler = handler.clone();
                thread::spawn(move || handler(endpoint, peer_addr, peer_port));
            }
            Err(err) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                match classify_accept_error(&err) {
                    AcceptFailure::Fatal => {
                        error!("listening socket failed, shutting the listener down: {}", err);
                        break;
                    }
                    AcceptFailure::OutOfDescriptors => {
                        // Shed load and retry soon; handler threads will
                        // release descriptors as they finish.
                        error!("out of file descriptors while accepting: {}", err);
                        thread::sleep(Duration::from_millis(100));
                    }
                    AcceptFailure::Transient => {
                        error!("failed to accept a connection: {}", err);
                        thread::sleep(accept_backoff());
                    }
                }
            }
        }
    }

    debug!("listener at {}:{} stopped", address, port);
}

enum AcceptFailure {
    /// The listening socket itself is gone.
    Fatal,
    /// EMFILE/ENFILE: no descriptor left for the accepted connection.
    OutOfDescriptors,
    /// Anything else, assumed to pass.
    Transient,
}

fn classify_accept_error(err: &std::io::Error) -> AcceptFailure {
    match err.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) => AcceptFailure::OutOfDescriptors,
        Some(libc::EBADF) | Some(libc::EINVAL) => AcceptFailure::Fatal,
        _ => AcceptFailure::Transient,
    }
}

fn accept_backoff() -> Duration {
    // Shortened under test so a failing accept does not stall the suite.
    if cfg!(test) {
        Duration::from_millis(10)
    } else {
        ACCEPT_BACKOFF
    }
}
