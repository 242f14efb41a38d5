//! Registry of connected control clients.

use std::{
    net::{Shutdown, SocketAddr, TcpStream},
    time::Instant,
};

use dashmap::DashMap;
use log::debug;

use crate::protocol::mailbox::ClientId;

struct ControlClient {
    addr: SocketAddr,
    connected_at: Instant,
    /// Clone of the handler's stream, kept so shutdown can unblock its read.
    stream: TcpStream,
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, ControlClient>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ClientId, addr: SocketAddr, stream: TcpStream) {
        self.clients.insert(
            id,
            ControlClient {
                addr,
                connected_at: Instant::now(),
                stream,
            },
        );
    }

    pub fn remove(&self, id: &ClientId) {
        self.clients.remove(id);
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Shuts down every client socket; handlers notice on their next read.
    pub fn shutdown_all(&self) {
        for entry in self.clients.iter() {
            let client = entry.value();
            debug!(
                "[CTRL] closing {} after {:.1}s",
                client.addr,
                client.connected_at.elapsed().as_secs_f64()
            );
            if let Err(e) = client.stream.shutdown(Shutdown::Both) {
                debug!("[CTRL] shutdown of {} failed: {e}", entry.key());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Read, net::TcpListener};

    #[test]
    fn shutdown_unblocks_registered_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut remote = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, addr) = listener.accept().unwrap();

        let registry = ClientRegistry::new();
        registry.register(ClientId::from(addr), addr, stream);
        assert_eq!(registry.len(), 1);

        registry.shutdown_all();
        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).unwrap_or(0), 0);

        registry.remove(&ClientId::from(addr));
        assert_eq!(registry.len(), 0);
    }
}
