//! Daemon discovery, TCP connection and the per-operation [`Connection`].
//!
//! Candidates are tried in order: loopback first, then every IPv4 address
//! bound to an up, non-loopback interface. The first host that accepts wins.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use adbloop_proto::{MAX_PAYLOAD, Message};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};

/// A byte stream a [`Connection`] can run over.
pub trait Transport: Read + Write {
    /// Current read timeout (`None` = block forever).
    fn read_timeout(&self) -> io::Result<Option<Duration>>;

    /// Replaces the read timeout.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shuts the stream down in both directions.
    fn close(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        Self::read_timeout(self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Self::set_read_timeout(self, timeout)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// An open session with the debug daemon, scoped to one operation.
///
/// The stream is shut down when the connection is dropped, so every exit
/// path of an operation releases the socket.
#[derive(Debug)]
pub struct Connection<S: Transport = TcpStream> {
    /// The underlying stream.
    stream: S,
    /// Largest payload the peer accepts; updated from its `CNXN`.
    max_payload: u32,
    /// Next local stream id to hand out.
    next_local_id: u32,
    /// Set once the stream has been shut down.
    closed: bool,
}

impl<S: Transport> Connection<S> {
    /// Wraps an already connected stream.
    pub const fn new(stream: S) -> Self {
        Self {
            stream,
            max_payload: MAX_PAYLOAD,
            next_local_id: 1,
            closed: false,
        }
    }

    /// Sends one message.
    pub fn send(&mut self, msg: &Message) -> Result<()> {
        debug!(
            cmd = %msg.name(),
            arg0 = msg.arg0,
            arg1 = msg.arg1,
            len = msg.payload.len(),
            "send"
        );
        adbloop_proto::encode(&mut self.stream, msg)?;
        Ok(())
    }

    /// Receives one message, bounded by the current read timeout.
    pub fn recv(&mut self) -> Result<Message> {
        let msg = adbloop_proto::decode(&mut self.stream)?;
        debug!(
            cmd = %msg.name(),
            arg0 = msg.arg0,
            arg1 = msg.arg1,
            len = msg.payload.len(),
            "recv"
        );
        Ok(msg)
    }

    /// Largest payload the peer accepts.
    pub const fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Adopts the max payload advertised by the peer.
    pub(crate) const fn set_max_payload(&mut self, max_payload: u32) {
        self.max_payload = max_payload;
    }

    /// Allocates a fresh local stream id.
    pub(crate) fn alloc_local_id(&mut self) -> u32 {
        let id = self.next_local_id;
        self.next_local_id = self.next_local_id.wrapping_add(1).max(1);
        id
    }

    /// Widens the read timeout until the returned guard is dropped.
    pub fn widen_read_timeout(&mut self, timeout: Duration) -> Result<ReadTimeoutGuard<'_, S>> {
        let previous = self.stream.read_timeout()?;
        self.stream.set_read_timeout(Some(timeout))?;
        Ok(ReadTimeoutGuard {
            conn: self,
            previous,
        })
    }

    /// Whether [`close`](Self::close) has run.
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shuts the stream down. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.close() {
            debug!("close: {e}");
        }
    }

    /// Borrows the underlying stream.
    pub const fn stream(&self) -> &S {
        &self.stream
    }
}

impl<S: Transport> Drop for Connection<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Restores the previous read timeout on drop.
#[derive(Debug)]
pub struct ReadTimeoutGuard<'a, S: Transport> {
    /// The connection whose timeout was widened.
    conn: &'a mut Connection<S>,
    /// Timeout to restore.
    previous: Option<Duration>,
}

impl<S: Transport> std::ops::Deref for ReadTimeoutGuard<'_, S> {
    type Target = Connection<S>;

    fn deref(&self) -> &Connection<S> {
        &*self.conn
    }
}

impl<S: Transport> std::ops::DerefMut for ReadTimeoutGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut Connection<S> {
        &mut *self.conn
    }
}

impl<S: Transport> Drop for ReadTimeoutGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.stream.set_read_timeout(self.previous) {
            debug!("restore read timeout: {e}");
        }
    }
}

/// Loopback first, then local IPv4 interface addresses, deduplicated.
pub fn candidate_hosts() -> Vec<IpAddr> {
    let mut hosts = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    for ip in interface_addrs() {
        if !hosts.contains(&ip) {
            hosts.push(ip);
        }
    }
    hosts
}

/// IPv4 addresses bound to up, non-loopback interfaces, in discovery order.
#[cfg(unix)]
fn interface_addrs() -> Vec<IpAddr> {
    use nix::net::if_::InterfaceFlags;
    use std::net::SocketAddrV4;

    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!("getifaddrs: {e}");
            return Vec::new();
        }
    };
    addrs
        .filter(|ifa| {
            ifa.flags.contains(InterfaceFlags::IFF_UP)
                && !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        })
        .filter_map(|ifa| {
            let sin = *ifa.address?.as_sockaddr_in()?;
            let ip = *SocketAddrV4::from(sin).ip();
            (!ip.is_loopback()).then_some(IpAddr::V4(ip))
        })
        .collect()
}

/// Interface discovery is Unix-only; elsewhere only loopback is tried.
#[cfg(not(unix))]
fn interface_addrs() -> Vec<IpAddr> {
    Vec::new()
}

/// Connects to `addr` and immediately disconnects, forcing the daemon to
/// drop a stale session. Returns whether anything was listening.
pub fn release_stale_session(addr: SocketAddr, config: &Config) -> bool {
    match TcpStream::connect_timeout(&addr, config.connect_timeout) {
        Ok(stream) => {
            let _ = stream.shutdown(Shutdown::Both);
            drop(stream);
            debug!(%addr, pause = ?config.reset_pause, "reset connection made");
            std::thread::sleep(config.reset_pause);
            true
        }
        Err(e) => {
            debug!(%addr, "reset connection: port not occupied ({e})");
            false
        }
    }
}

/// Resets any stale session, then connects to the first reachable candidate.
pub fn connect(config: &Config) -> Result<Connection<TcpStream>> {
    let hosts = if config.hosts.is_empty() {
        candidate_hosts()
    } else {
        config.hosts.clone()
    };
    let addrs: Vec<SocketAddr> = hosts
        .into_iter()
        .map(|ip| SocketAddr::new(ip, config.port))
        .collect();

    if let Some(&primary) = addrs.first() {
        release_stale_session(primary, config);
    }

    for &addr in &addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(config.read_timeout))?;
                stream.set_nodelay(true)?;
                info!(%addr, "connected to debug daemon");
                return Ok(Connection::new(stream));
            }
            Err(e) => debug!(%addr, "connect failed: {e}"),
        }
    }

    Err(Error::NoConnection {
        port: config.port,
        tried: addrs,
    })
}
