//! The WebSocket server endpoint: listener, connection factory and a
//! registry of live connections.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::*;

use crate::error::Result;
use crate::handshake::server::SubprotocolPolicy;
use crate::protocol::{Connection, ConnectionConfig};
use crate::stream::Stream;

/// Metadata the server keeps for each live connection.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Address of the connected peer.
    pub addr: SocketAddr,
}

type Registry = Arc<Mutex<HashMap<u64, PeerInfo>>>;

/// Frees the peer's registry slot when its connection is dropped.
#[derive(Debug)]
pub(crate) struct Registration {
    registry: Registry,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(&self.id);
        }
    }
}

/// A WebSocket server endpoint.
///
/// Owns the listening socket and manufactures server-role [`Connection`]s;
/// each live connection occupies a slot in the registry until it is
/// dropped. Connections block, so a typical server accepts in a loop and
/// moves each connection to its own thread.
///
/// ```no_run
/// # use scheelite::{Server, Event};
/// let server = Server::bind("127.0.0.1:8080")?
///     .protocols(vec!["superchat".to_string()]);
/// loop {
///     let mut conn = server.accept()?;
///     std::thread::spawn(move || {
///         while let Ok(_event) = conn.recv() {
///             // handle Open / Text / Binary / Pong / Close
///         }
///     });
/// }
/// # Ok::<(), scheelite::Error>(())
/// ```
pub struct Server {
    listener: TcpListener,
    #[cfg(feature = "tls")]
    acceptor: Option<native_tls::TlsAcceptor>,
    config: ConnectionConfig,
    policy: SubprotocolPolicy,
    registry: Registry,
    next_id: AtomicU64,
}

impl Server {
    /// Bind a plain TCP listener. The server is accepting ("listening") as
    /// soon as this returns; dropping the server stops it.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Server> {
        let listener = TcpListener::bind(addr)?;
        debug!("listening on {:?}", listener.local_addr());
        Ok(Server {
            listener,
            #[cfg(feature = "tls")]
            acceptor: None,
            config: ConnectionConfig::default(),
            policy: SubprotocolPolicy::default(),
            registry: Registry::default(),
            next_id: AtomicU64::new(0),
        })
    }

    /// Bind a TLS listener using the given server identity.
    #[cfg(feature = "tls")]
    pub fn bind_secure(addr: impl ToSocketAddrs, identity: native_tls::Identity) -> Result<Server> {
        let acceptor = native_tls::TlsAcceptor::new(identity)?;
        let mut server = Server::bind(addr)?;
        server.acceptor = Some(acceptor);
        Ok(server)
    }

    /// Use the given connection configuration for accepted connections.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Negotiate subprotocols against this allow-list: the first protocol
    /// of a client's offer that appears in the list is chosen.
    pub fn protocols(mut self, protocols: Vec<String>) -> Self {
        self.policy = SubprotocolPolicy::Allowed(protocols);
        self
    }

    /// Negotiate subprotocols with a custom selector. The selector receives
    /// the client's offer in order and returns the chosen protocol, if any.
    pub fn select_protocol(
        mut self,
        select: impl Fn(&[String]) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.policy = SubprotocolPolicy::Select(Arc::new(select));
        self
    }

    /// Accept one inbound transport and wrap it in a server-role
    /// connection.
    ///
    /// The connection is still `Connecting`: its first
    /// [`recv`](Connection::recv) answers the client's upgrade request and
    /// yields [`Event::Open`](crate::Event::Open).
    pub fn accept(&self) -> Result<Connection<Stream>> {
        let (stream, addr) = self.listener.accept()?;
        debug!("inbound connection from {addr}");
        let stream = self.wrap(stream)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .expect("Bug: registry lock poisoned")
            .insert(id, PeerInfo { addr });
        let mut conn = Connection::server(stream, self.policy.clone(), Some(self.config));
        conn.registration = Some(Registration { registry: Arc::clone(&self.registry), id });
        Ok(conn)
    }

    #[cfg(feature = "tls")]
    fn wrap(&self, stream: TcpStream) -> Result<Stream> {
        match &self.acceptor {
            Some(acceptor) => acceptor.accept(stream).map(Stream::Tls).map_err(|e| match e {
                native_tls::HandshakeError::Failure(f) => crate::error::Error::Tls(f),
                native_tls::HandshakeError::WouldBlock(_) => {
                    panic!("Bug: TLS handshake not blocked")
                }
            }),
            None => Ok(Stream::Plain(stream)),
        }
    }

    #[cfg(not(feature = "tls"))]
    fn wrap(&self, stream: TcpStream) -> Result<Stream> {
        Ok(Stream::Plain(stream))
    }

    /// A snapshot of the currently live connections.
    pub fn connections(&self) -> Vec<PeerInfo> {
        self.registry.lock().expect("Bug: registry lock poisoned").values().cloned().collect()
    }

    /// Number of currently live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.lock().expect("Bug: registry lock poisoned").len()
    }

    /// The local address this server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Stop listening. Connections already accepted keep working; their
    /// registry entries disappear as they are dropped.
    pub fn close(self) {
        debug!("server closing");
    }
}
