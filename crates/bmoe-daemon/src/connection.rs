//! Per-connection socket tasks.
//!
//! Each TCP connection gets a reader task that decodes frames and forwards
//! them to the daemon, and a writer task that drains the peer's outbound
//! queue. The routing engine only ever sees the queue, through
//! [`ChannelLink`]. When the writer finishes it tells the reader to stop, so
//! the socket closes fully without waiting for the remote side.

use crate::daemon::DaemonEvent;
use bmoe_core::{ConnectionId, FrameDecoder, Link, LinkError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Instruction for a writer task.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Bytes(Vec<u8>),
    /// Flush what is queued, then shut the socket down.
    Close,
}

/// [`Link`] backed by a writer task's queue.
pub(crate) struct ChannelLink {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ChannelLink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self { tx }
    }
}

impl Link for ChannelLink {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), LinkError> {
        self.tx
            .send(Outgoing::Bytes(bytes))
            .map_err(|_| LinkError::Closed)
    }

    fn close(&mut self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

/// Decode frames until the socket closes, the stream turns out malformed or
/// the writer is done.
///
/// Always ends by reporting the connection closed.
pub(crate) async fn read_loop(
    connection: ConnectionId,
    mut reader: OwnedReadHalf,
    mut writer_done: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<DaemonEvent>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'read: loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = &mut writer_done => {
                tracing::debug!(%connection, "Closed after writing");
                break;
            }
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(%connection, "Read error: {}", e);
                break;
            }
        };
        decoder.push(&buf[..n]);

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if events.send(DaemonEvent::Frame { connection, frame }).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(%connection, "Dropping connection: {}", e);
                    break 'read;
                }
            }
        }
    }

    if decoder.buffered() > 0 {
        tracing::debug!(%connection, bytes = decoder.buffered(), "Discarding partial frame");
    }
    let _ = events.send(DaemonEvent::Closed { connection });
}

/// Write queued bytes until the queue closes or a close is requested.
///
/// Dropping `done` on the way out stops the matching reader.
pub(crate) async fn write_loop(
    connection: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    done: oneshot::Sender<()>,
) {
    while let Some(message) = outgoing.recv().await {
        match message {
            Outgoing::Bytes(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    tracing::debug!(%connection, "Write error: {}", e);
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.shutdown().await;
    drop(done);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmoe_core::{Metadata, encode_frame};
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn link_fails_once_writer_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut link = ChannelLink::new(tx);
        assert!(link.send(b"x".to_vec()).is_ok());
        drop(rx);
        assert!(matches!(link.send(b"y".to_vec()), Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn reader_forwards_frames_then_reports_close() {
        let (mut remote, local) = socket_pair().await;
        let (read_half, _write_half) = local.into_split();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_writer_done, done_rx) = oneshot::channel();
        let connection = ConnectionId::new(1);
        let task = tokio::spawn(read_loop(connection, read_half, done_rx, events_tx));

        let mut metadata = Metadata::data("text/plain");
        let bytes = encode_frame(&mut metadata, Some(b"hi")).unwrap();
        let (head, tail) = bytes.split_at(3);
        remote.write_all(head).await.unwrap();
        remote.write_all(tail).await.unwrap();
        drop(remote);

        match events_rx.recv().await.unwrap() {
            DaemonEvent::Frame { connection: c, frame } => {
                assert_eq!(c, connection);
                assert_eq!(frame.payload.as_deref(), Some(&b"hi"[..]));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            DaemonEvent::Closed { connection: c } if c == connection
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reader_stops_at_malformed_metadata() {
        let (mut remote, local) = socket_pair().await;
        let (read_half, _write_half) = local.into_split();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_writer_done, done_rx) = oneshot::channel();
        let connection = ConnectionId::new(2);
        let task = tokio::spawn(read_loop(connection, read_half, done_rx, events_tx));

        remote.write_all(b"{oops\0{}\0").await.unwrap();

        assert!(matches!(
            events_rx.recv().await.unwrap(),
            DaemonEvent::Closed { .. }
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn writer_flushes_before_close() {
        let (mut remote, local) = socket_pair().await;
        let (_read_half, write_half) = local.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, _done_rx) = oneshot::channel();
        let task = tokio::spawn(write_loop(ConnectionId::new(3), write_half, rx, done_tx));

        let mut link = ChannelLink::new(tx);
        link.send(b"abc".to_vec()).unwrap();
        link.send(b"def".to_vec()).unwrap();
        link.close();
        task.await.unwrap();

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"abcdef");
    }

    #[tokio::test]
    async fn closing_drops_the_socket_while_remote_stays_open() {
        let (mut remote, local) = socket_pair().await;
        let (read_half, write_half) = local.into_split();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let connection = ConnectionId::new(4);
        let reader = tokio::spawn(read_loop(connection, read_half, done_rx, events_tx));
        let writer = tokio::spawn(write_loop(connection, write_half, rx, done_tx));

        let mut link = ChannelLink::new(tx);
        link.send(b"bye".to_vec()).unwrap();
        link.close();

        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), events_rx.recv())
            .await
            .expect("reader kept waiting on the remote")
            .unwrap();
        assert!(matches!(closed, DaemonEvent::Closed { connection: c } if c == connection));
        writer.await.unwrap();
        reader.await.unwrap();

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }
}
