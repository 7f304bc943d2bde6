use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info};

use crate::commands::{KernelState, Session};
use crate::transport::Client;

/// Accepts connections and hands each one to its own detached thread.
///
/// There is no pool and no upper bound; every thread shares the same
/// [`KernelState`].
pub struct ConnectionDispatcher {
    listener: TcpListener,
    kernel: Arc<KernelState>,
    next_client_id: usize,
}

impl ConnectionDispatcher {
    pub fn bind(addr: impl ToSocketAddrs, kernel: Arc<KernelState>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            kernel,
            next_client_id: 1,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop. Only returns if the listener itself fails.
    pub fn serve(mut self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "listening");
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let client_id = self.next_client_id;
                    self.next_client_id += 1;
                    if let Err(e) = self.spawn_connection(stream, peer, client_id) {
                        error!(client_id, error = %e, "failed to spawn connection thread");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "accept failed, continuing");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        client_id: usize,
    ) -> io::Result<()> {
        let kernel = Arc::clone(&self.kernel);
        thread::Builder::new()
            .name(format!("conn-{}", client_id))
            .spawn(move || {
                debug!(client_id, %peer, "connection accepted");
                let mut client = Client::new(stream, Session::new(client_id, kernel.generation));
                match client.serve(&kernel) {
                    Ok(()) => debug!(client_id, "connection closed"),
                    Err(e) => info!(client_id, error = %e, "connection dropped"),
                }
            })?;
        Ok(())
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::WouldBlock
    )
}
