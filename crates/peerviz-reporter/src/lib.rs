//! peerviz-reporter: producer-side client for a peerviz server.
//!
//! Construct one [`Reporter`] per process and pass it to the code that
//! observes protocol traffic. The connection is opened on the first report
//! and kept for the life of the experiment; the `END` report waits for the
//! server's acknowledgement and then closes it.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use peerviz_core::{END_ACK, ProtocolError};

pub use peerviz_core::Event;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("event cannot be encoded: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server unreachable: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end acknowledgement {0:?}")]
    UnexpectedAck([u8; 2]),

    #[error("reporter is closed")]
    Closed,
}

#[derive(Debug)]
enum Connection {
    Pending,
    Open(TcpStream),
    Closed,
}

/// Persistent event connection to one server address.
#[derive(Debug)]
pub struct Reporter {
    addr: String,
    conn: Connection,
}

impl Reporter {
    /// Create a reporter for `addr` (`host:port`). Nothing is dialed yet.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Connection::Pending,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True once the end handshake completed or the server became unreachable.
    pub fn is_closed(&self) -> bool {
        matches!(self.conn, Connection::Closed)
    }

    /// Send one event. For `END`, block until the server acknowledges, then
    /// close the connection.
    pub async fn report(&mut self, event: &Event) -> Result<(), ReportError> {
        let frame = event.to_frame()?;
        let result = self.send(frame.as_bytes(), event.awaits_ack()).await;
        if let Err(ReportError::Io(e)) = &result {
            tracing::warn!(addr = %self.addr, error = %e, "reporting to unreachable server");
            self.conn = Connection::Closed;
        }
        result
    }

    async fn send(&mut self, frame: &[u8], await_ack: bool) -> Result<(), ReportError> {
        if let Connection::Pending = self.conn {
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            tracing::debug!(addr = %self.addr, "reporter connected");
            self.conn = Connection::Open(stream);
        }
        let Connection::Open(stream) = &mut self.conn else {
            return Err(ReportError::Closed);
        };

        stream.write_all(frame).await?;
        stream.flush().await?;
        if !await_ack {
            return Ok(());
        }

        let mut ack = [0u8; 2];
        stream.read_exact(&mut ack).await?;
        // Best effort: the server closes its side right after acknowledging.
        let _ = stream.shutdown().await;
        self.conn = Connection::Closed;
        if &ack != END_ACK {
            return Err(ReportError::UnexpectedAck(ack));
        }
        Ok(())
    }
}
