use std::{fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, oneshot, watch},
    time::timeout,
};
use tracing::debug;

use crate::{
    protocol::{self, Delivery},
    registry::PeerId,
};

/// Lifecycle signal shared between a connection's reader, its writer task
/// and its handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Open,
    /// A terminal value was queued; the reader must not read again.
    Halted,
    /// The socket was shut down and released.
    Closed,
}

/// Outcome of one receive on a [`PeerConnection`].
#[derive(Debug)]
pub enum Received {
    Message(String),
    /// The remote end closed its side.
    Disconnected,
    Failed(io::Error),
    /// No bytes arrived within the idle timeout.
    Idle,
    /// The connection was halted or closed from elsewhere.
    Stopped,
}

/// Reading side of one client socket. Owned by the connection's task.
pub struct PeerConnection {
    id: PeerId,
    reader: OwnedReadHalf,
    buffer: Vec<u8>,
    signal: watch::Receiver<Signal>,
}

/// Shareable writing side of one client socket.
///
/// Writes are queued to a task that owns the write half, so payloads reach
/// the socket in the order they were queued. Clones refer to the same
/// socket: the registry holds one, the connection's own task holds another,
/// and a partner reaches it through the registry.
#[derive(Clone)]
pub struct PeerHandle {
    inner: Arc<Shared>,
}

struct Shared {
    id: PeerId,
    outbox: mpsc::UnboundedSender<Outgoing>,
    signal: watch::Sender<Signal>,
}

struct Outgoing {
    text: String,
    done: Option<oneshot::Sender<io::Result<()>>>,
}

impl PeerConnection {
    /// Splits an accepted stream into its reading side and a handle, and
    /// starts the task that writes to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(stream: TcpStream, id: SocketAddr, buffer_size: usize) -> (Self, PeerHandle) {
        let (reader, writer) = stream.into_split();
        let (signal_tx, signal_rx) = watch::channel(Signal::Open);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_writer(id, writer, outbox_rx, signal_tx.subscribe()));

        let handle = PeerHandle {
            inner: Arc::new(Shared {
                id,
                outbox: outbox_tx,
                signal: signal_tx,
            }),
        };
        let connection = Self {
            id,
            reader,
            buffer: vec![0; buffer_size],
            signal: signal_rx,
        };

        (connection, handle)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Waits for the next message, at most one buffer's worth of bytes.
    ///
    /// The pending read is abandoned as soon as the connection is halted or
    /// closed.
    pub async fn receive(&mut self, idle_timeout: Option<Duration>) -> Received {
        let Self {
            reader,
            buffer,
            signal,
            ..
        } = self;

        if *signal.borrow() != Signal::Open {
            return Received::Stopped;
        }

        let read = async {
            match idle_timeout {
                Some(limit) => timeout(limit, reader.read(buffer)).await.ok(),
                None => Some(reader.read(buffer).await),
            }
        };

        let outcome = select! {
            outcome = read => outcome,
            _ = stopped(signal) => return Received::Stopped,
        };

        match outcome {
            None => Received::Idle,
            Some(Ok(0)) => Received::Disconnected,
            Some(Ok(n)) => Received::Message(protocol::decode(&buffer[..n])),
            Some(Err(err)) => Received::Failed(err),
        }
    }
}

async fn stopped(signal: &mut watch::Receiver<Signal>) {
    // A dropped sender means every handle is gone, which also ends the read.
    let _ = signal.wait_for(|state| *state != Signal::Open).await;
}

async fn closed(signal: &mut watch::Receiver<Signal>) {
    let _ = signal.wait_for(|state| *state == Signal::Closed).await;
}

/// Drains the outbox into the socket until the connection is closed or a
/// write fails, then shuts the write half down.
async fn run_writer(
    id: PeerId,
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    mut signal: watch::Receiver<Signal>,
) {
    loop {
        let outgoing = select! {
            biased;
            _ = closed(&mut signal) => break,
            next = outbox.recv() => match next {
                Some(outgoing) => outgoing,
                None => break,
            },
        };

        // A write to a peer that stopped reading must not outlive the socket.
        let result = select! {
            biased;
            _ = closed(&mut signal) => Err(closed_error()),
            result = write_text(&mut writer, &outgoing.text) => result,
        };

        let failed = match &result {
            Ok(()) => {
                debug!(peer = %id, text = %outgoing.text, "sent");
                false
            }
            Err(error) => {
                debug!(peer = %id, ?error, "write failed");
                true
            }
        };
        if let Some(done) = outgoing.done {
            let _ = done.send(result);
        }
        if failed {
            break;
        }
    }

    if let Err(error) = writer.shutdown().await {
        debug!(peer = %id, ?error, "socket shutdown failed");
    }
}

async fn write_text(writer: &mut OwnedWriteHalf, text: &str) -> io::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn signal(&self) -> Signal {
        *self.inner.signal.borrow()
    }

    /// Queues `text` and waits until it has been written to the socket.
    pub async fn send(&self, text: &str, delivery: Delivery) -> io::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(text, delivery, Some(done_tx))?;
        done_rx.await.unwrap_or_else(|_| Err(closed_error()))
    }

    /// Queues `text` without waiting for the write. Anything queued later on
    /// this handle is written after it.
    pub fn post(&self, text: &str, delivery: Delivery) -> io::Result<()> {
        self.enqueue(text, delivery, None)
    }

    /// A [`Delivery::Final`] halts this connection's reader before the text is
    /// queued, so no further receive is armed.
    fn enqueue(
        &self,
        text: &str,
        delivery: Delivery,
        done: Option<oneshot::Sender<io::Result<()>>>,
    ) -> io::Result<()> {
        if self.signal() == Signal::Closed {
            return Err(closed_error());
        }
        if delivery == Delivery::Final {
            self.inner.signal.send_if_modified(|state| {
                if *state == Signal::Open {
                    *state = Signal::Halted;
                    true
                } else {
                    false
                }
            });
        }

        self.inner
            .outbox
            .send(Outgoing {
                text: text.to_owned(),
                done,
            })
            .map_err(|_| closed_error())
    }

    /// Closes the connection: the reader stops, any blocked write is
    /// abandoned and the writer task shuts the socket down. Never waits on
    /// the socket, and only the first call has any effect.
    pub fn dispose(&self) {
        let first = self.inner.signal.send_if_modified(|state| {
            if *state == Signal::Closed {
                false
            } else {
                *state = Signal::Closed;
                true
            }
        });
        if first {
            debug!(peer = %self.id(), "disposed");
        }
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.inner.id)
            .field("signal", &self.signal())
            .finish()
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for PeerHandle {}
