//! Re-bindable TCP listeners.
//!
//! A [`ListenerSocket`] owns at most one bound `TcpListener`. Accept loops
//! poll it with a bounded wait; if it is closed, by a hard accept error or an
//! explicit [`ListenerSocket::close`], accepts report `NotBound` until the
//! health monitor calls [`ListenerSocket::bind`] again. Clients already
//! accepted are unaffected by either.

use std::{
    io,
    net::{IpAddr, SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use log::{info, warn};
use parking_lot::Mutex;
use socket2::{Domain, SockAddr, Socket, Type};

use crate::error::ServerError;

const ACCEPT_POLL: Duration = Duration::from_millis(20);

pub struct ListenerSocket {
    role: &'static str,
    host: IpAddr,
    /// Requested port; replaced by the OS-assigned one after the first bind
    /// so re-binds land on the same port.
    port: Mutex<u16>,
    backlog: i32,
    slot: Mutex<Option<TcpListener>>,
}

impl ListenerSocket {
    pub fn new(role: &'static str, host: IpAddr, port: u16, backlog: i32) -> Self {
        Self {
            role,
            host,
            port: Mutex::new(port),
            backlog,
            slot: Mutex::new(None),
        }
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    pub fn port(&self) -> u16 {
        *self.port.lock()
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port())
    }

    pub fn is_bound(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Binds (or re-binds) the listener. A no-op if it is already bound.
    pub fn bind(&self) -> Result<(), ServerError> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Ok(());
        }
        let port = self.port();
        let listener = open_listener(SocketAddr::new(self.host, port), self.backlog)
            .map_err(|source| ServerError::Bind { role: self.role, port, source })?;
        let bound = listener.local_addr()?.port();
        *self.port.lock() = bound;
        info!("[{}] listening on {}:{}", self.role, self.host, bound);
        *slot = Some(listener);
        Ok(())
    }

    /// Drops the bound socket. The port is released immediately.
    pub fn close(&self) {
        if self.slot.lock().take().is_some() {
            info!("[{}] listener closed", self.role);
        }
    }

    /// Non-blocking accept. `Ok(None)` when nobody is waiting.
    pub fn try_accept(&self) -> Result<Option<(TcpStream, SocketAddr)>, ServerError> {
        let mut slot = self.slot.lock();
        let Some(listener) = slot.as_ref() else {
            return Err(ServerError::NotBound);
        };
        match listener.accept() {
            Ok((stream, addr)) => {
                // Accepted sockets inherit non-blocking mode on some platforms.
                stream.set_nonblocking(false)?;
                Ok(Some((stream, addr)))
            }
            Err(e) if is_transient(&e) => Ok(None),
            Err(e) => {
                warn!("[{}] accept failed, closing listener: {e}", self.role);
                *slot = None;
                Err(ServerError::Io(e))
            }
        }
    }

    /// Polls for a connection for at most `timeout`.
    pub fn accept_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<(TcpStream, SocketAddr)>, ServerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(conn) = self.try_accept()? {
                return Ok(Some(conn));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(ACCEPT_POLL.min(deadline - now));
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

fn open_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    {
        socket.set_reuse_port(true).ok();
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback(role: &'static str) -> ListenerSocket {
        ListenerSocket::new(role, IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 4)
    }

    #[test]
    fn accept_times_out_without_clients() {
        let l = loopback("T1");
        l.bind().unwrap();
        let start = Instant::now();
        assert!(l.accept_timeout(Duration::from_millis(60)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn closed_listener_reports_not_bound_then_rebinds_same_port() {
        let l = loopback("T2");
        l.bind().unwrap();
        let port = l.port();
        assert_ne!(port, 0);

        l.close();
        assert!(!l.is_bound());
        assert!(matches!(l.try_accept(), Err(ServerError::NotBound)));

        l.bind().unwrap();
        assert_eq!(l.port(), port);
        let _client = TcpStream::connect(l.local_addr()).unwrap();
        let accepted = l.accept_timeout(Duration::from_secs(2)).unwrap();
        assert!(accepted.is_some());
    }
}
