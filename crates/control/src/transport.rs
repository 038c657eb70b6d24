//! Line-oriented transports underneath [`PacketLink`](crate::link::PacketLink).
//!
//! The `serial` feature enables the real UART transport; the in-memory pair is
//! always available for tests and for embedding a simulated board.

use std::future::Future;
use std::io;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// A bidirectional line transport.
///
/// Implementations must be safe to read from one task while another writes.
pub trait Transport: Send + Sync + 'static {
    /// Read one line without its terminator. `Ok(None)` means nothing arrived
    /// within the transport's own poll window.
    fn read_line(&self) -> impl Future<Output = io::Result<Option<String>>> + Send;

    /// Write one complete line. `line` already carries its `\n`.
    fn write_line(&self, line: &str) -> impl Future<Output = io::Result<()>> + Send;

    /// Drop any bytes buffered before the session started.
    fn discard_input(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Opens a fresh [`Transport`] for each link session.
pub trait Connect: Send + Sync {
    type Transport: Transport;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Transport>> + Send;
}

/// Read errors after which the transport will never yield data again.
pub fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Split the first complete line off `pending`, dropping the `\n`.
fn take_line(pending: &mut String) -> Option<String> {
    let pos = pending.find('\n')?;
    let mut line: String = pending.drain(..=pos).collect();
    line.pop();
    Some(line)
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

const MEMORY_POLL: Duration = Duration::from_millis(50);

struct MemoryInbox {
    chunks: mpsc::UnboundedReceiver<String>,
    pending: String,
}

/// Host side of an in-process duplex line channel.
pub struct MemoryTransport {
    inbox: Mutex<MemoryInbox>,
    outgoing: mpsc::UnboundedSender<String>,
}

/// Board side of an in-process duplex line channel. Dropping it makes the
/// host's reads fail with `UnexpectedEof`.
pub struct MemoryPeer {
    to_host: mpsc::UnboundedSender<String>,
    from_host: Mutex<mpsc::UnboundedReceiver<String>>,
}

pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let (to_host, chunks) = mpsc::unbounded_channel();
    let (outgoing, from_host) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            inbox: Mutex::new(MemoryInbox {
                chunks,
                pending: String::new(),
            }),
            outgoing,
        },
        MemoryPeer {
            to_host,
            from_host: Mutex::new(from_host),
        },
    )
}

impl Transport for MemoryTransport {
    async fn read_line(&self) -> io::Result<Option<String>> {
        let mut inbox = self.inbox.lock().await;
        loop {
            if let Some(line) = take_line(&mut inbox.pending) {
                return Ok(Some(line));
            }
            match timeout(MEMORY_POLL, inbox.chunks.recv()).await {
                Ok(Some(chunk)) => inbox.pending.push_str(&chunk),
                Ok(None) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "memory peer disconnected",
                    ))
                }
                Err(_) => return Ok(None),
            }
        }
    }

    async fn write_line(&self, line: &str) -> io::Result<()> {
        self.outgoing
            .send(line.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory peer disconnected"))
    }

    async fn discard_input(&self) -> io::Result<()> {
        let mut inbox = self.inbox.lock().await;
        while inbox.chunks.try_recv().is_ok() {}
        inbox.pending.clear();
        Ok(())
    }
}

impl MemoryPeer {
    /// Push raw text towards the host. Lines may be split or batched freely.
    pub fn send(&self, text: &str) -> io::Result<()> {
        self.to_host
            .send(text.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host transport dropped"))
    }

    /// Next line written by the host, or `None` on timeout or disconnect.
    pub async fn recv_line(&self, wait: Duration) -> Option<String> {
        let mut rx = self.from_host.lock().await;
        timeout(wait, rx.recv()).await.ok().flatten()
    }

    /// Everything the host has written so far.
    pub async fn drain(&self) -> Vec<String> {
        let mut rx = self.from_host.lock().await;
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }
}

/// Hands out a single pre-built [`MemoryTransport`]. Later connects fail with
/// `NotConnected`.
pub struct MemoryConnector {
    transport: StdMutex<Option<MemoryTransport>>,
}

impl MemoryConnector {
    pub fn new(transport: MemoryTransport) -> Self {
        Self {
            transport: StdMutex::new(Some(transport)),
        }
    }
}

impl Connect for MemoryConnector {
    type Transport = MemoryTransport;

    async fn connect(&self) -> io::Result<MemoryTransport> {
        let taken = self
            .transport
            .lock()
            .map_err(|_| io::Error::other("memory connector lock poisoned"))?
            .take();
        taken.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "memory transport already used")
        })
    }
}

// ---------------------------------------------------------------------------
// Serial transport (requires the `serial` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "serial")]
pub use serial::{SerialConnector, SerialTransport};

#[cfg(feature = "serial")]
mod serial {
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serialport::{ClearBuffer, SerialPort};

    use super::{take_line, Connect, Transport};

    /// Blocking read timeout; bounds how long a cancelled read can linger.
    const READ_TIMEOUT: Duration = Duration::from_millis(100);
    /// Boards that reset on open (DTR) need a moment before they talk.
    const SETTLE: Duration = Duration::from_millis(500);

    struct SerialReader {
        port: Box<dyn SerialPort>,
        pending: String,
    }

    /// UART transport, 8N1. Reads and writes use independent port handles so
    /// the reader never blocks a command write.
    pub struct SerialTransport {
        reader: Arc<Mutex<SerialReader>>,
        writer: Arc<Mutex<Box<dyn SerialPort>>>,
    }

    pub struct SerialConnector {
        path: String,
        baud_rate: u32,
    }

    impl SerialConnector {
        pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                path: path.into(),
                baud_rate,
            }
        }
    }

    fn poisoned() -> io::Error {
        io::Error::other("serial port lock poisoned")
    }

    fn join_err(e: tokio::task::JoinError) -> io::Error {
        io::Error::other(format!("serial worker failed: {e}"))
    }

    impl Connect for SerialConnector {
        type Transport = SerialTransport;

        async fn connect(&self) -> io::Result<SerialTransport> {
            let path = self.path.clone();
            let baud_rate = self.baud_rate;
            let (read_port, write_port) = tokio::task::spawn_blocking(move || {
                let port = serialport::new(&path, baud_rate)
                    .timeout(READ_TIMEOUT)
                    .data_bits(serialport::DataBits::Eight)
                    .stop_bits(serialport::StopBits::One)
                    .parity(serialport::Parity::None)
                    .open()?;
                let writer = port.try_clone()?;
                Ok::<_, io::Error>((port, writer))
            })
            .await
            .map_err(join_err)??;

            tracing::info!(path = %self.path, baud_rate, "serial port opened");
            tokio::time::sleep(SETTLE).await;

            Ok(SerialTransport {
                reader: Arc::new(Mutex::new(SerialReader {
                    port: read_port,
                    pending: String::new(),
                })),
                writer: Arc::new(Mutex::new(write_port)),
            })
        }
    }

    impl Transport for SerialTransport {
        async fn read_line(&self) -> io::Result<Option<String>> {
            let reader = Arc::clone(&self.reader);
            tokio::task::spawn_blocking(move || {
                let mut reader = reader.lock().map_err(|_| poisoned())?;
                if let Some(line) = take_line(&mut reader.pending) {
                    return Ok(Some(line));
                }
                let mut buf = [0u8; 256];
                match reader.port.read(&mut buf) {
                    Ok(0) => Ok(None),
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        reader.pending.push_str(&chunk);
                        Ok(take_line(&mut reader.pending))
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(join_err)?
        }

        async fn write_line(&self, line: &str) -> io::Result<()> {
            let writer = Arc::clone(&self.writer);
            let bytes = line.as_bytes().to_vec();
            tokio::task::spawn_blocking(move || {
                let mut port = writer.lock().map_err(|_| poisoned())?;
                port.write_all(&bytes)?;
                port.flush()
            })
            .await
            .map_err(join_err)?
        }

        async fn discard_input(&self) -> io::Result<()> {
            let reader = Arc::clone(&self.reader);
            tokio::task::spawn_blocking(move || {
                let mut reader = reader.lock().map_err(|_| poisoned())?;
                reader.pending.clear();
                reader.port.clear(ClearBuffer::All)?;
                Ok(())
            })
            .await
            .map_err(join_err)?
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
