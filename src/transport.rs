mod framing;

use std::io::{self, Read, Write};
use std::net::TcpStream;

use tracing::{debug, warn};

use crate::commands::{execute_command, KernelState, Session};
use crate::protocol;

pub use framing::{parse_available_commands, ClientState, ParsedCommand};

/// One accepted connection, served by a dedicated blocking thread.
pub struct Client {
    pub stream: TcpStream,
    pub buffer: Vec<u8>,
    pub state: ClientState,
    pub session: Session,
}

impl Client {
    pub fn new(stream: TcpStream, session: Session) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            state: ClientState::WaitingForHeader,
            session,
        }
    }

    /// Reads, executes and answers frames until the peer hangs up.
    ///
    /// Request failures are answered with `-ERR` lines; only socket errors end
    /// the loop.
    pub fn serve(&mut self, kernel: &KernelState) -> io::Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::ConnectionReset
                        || e.kind() == io::ErrorKind::BrokenPipe =>
                {
                    debug!(client_id = self.session.client_id, error = %e, "peer went away");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.buffer.extend_from_slice(&chunk[..n]);

            for command in parse_available_commands(&mut self.buffer, &mut self.state) {
                let response = match command {
                    ParsedCommand::Ok { header, payload } => {
                        execute_command(kernel, &mut self.session, header, payload)
                    }
                    ParsedCommand::Err(e) => {
                        warn!(client_id = self.session.client_id, error = %e, "bad header");
                        kernel.metrics.record_command(false);
                        protocol::response_err_code("BAD_HEADER", &e)
                    }
                };
                self.stream.write_all(&response)?;
            }
            self.stream.flush()?;
        }
    }
}
