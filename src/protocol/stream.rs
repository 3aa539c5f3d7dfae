//! Byte plumbing between a git subprocess and a transport.
//!
//! [`ChunkWriter`] is the `AsyncWrite` the runner copies into.  Every write
//! becomes one [`Bytes`] chunk on a bounded channel, so bytes reach the
//! client as soon as git produces them and a slow client back-pressures git.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{DropGuard, PollSender};

pub type Chunk = io::Result<Bytes>;

/// Chunks in flight between git and the client.
pub const CHANNEL_CAPACITY: usize = 16;

pub fn channel() -> (ChunkWriter, mpsc::Receiver<Chunk>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (ChunkWriter::new(tx), rx)
}

pub struct ChunkWriter {
    tx: PollSender<Chunk>,
}

impl ChunkWriter {
    pub fn new(tx: mpsc::Sender<Chunk>) -> Self {
        Self {
            tx: PollSender::new(tx),
        }
    }

    /// Push an error to the reader.  For an HTTP body this aborts the
    /// transfer instead of ending it cleanly.
    pub async fn abort(&self, err: io::Error) {
        if let Some(tx) = self.tx.get_ref() {
            let _ = tx.send(Err(err)).await;
        }
    }
}

fn receiver_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client went away")
}

impl AsyncWrite for ChunkWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.tx.poll_reserve(cx)).map_err(|_| receiver_gone())?;
        self.tx
            .send_item(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| receiver_gone())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}

/// Receiving end used as a response body.  Dropping it (the client hung
/// up) fires the guard, which cancels the request's subprocess.
pub struct ChunkStream {
    inner: ReceiverStream<Chunk>,
    _cancel_on_drop: Option<DropGuard>,
}

impl ChunkStream {
    pub fn new(rx: mpsc::Receiver<Chunk>, guard: Option<DropGuard>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
            _cancel_on_drop: guard,
        }
    }
}

impl Stream for ChunkStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn each_write_is_one_chunk() {
        let (mut writer, rx) = channel();
        writer.write_all(b"0008NAK\n").await.unwrap();
        writer.write_all(b"0000").await.unwrap();
        drop(writer);

        let chunks: Vec<_> = ChunkStream::new(rx, None)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec![Bytes::from_static(b"0008NAK\n"), Bytes::from_static(b"0000")]);
    }

    #[tokio::test]
    async fn write_fails_after_reader_dropped() {
        let (mut writer, rx) = channel();
        drop(rx);
        let err = writer.write_all(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn abort_surfaces_error_to_reader() {
        let (writer, rx) = channel();
        writer.abort(io::Error::other("git died")).await;
        drop(writer);
        let mut stream = ChunkStream::new(rx, None);
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_stream_cancels_token() {
        let token = CancellationToken::new();
        let (_writer, rx) = channel();
        let stream = ChunkStream::new(rx, Some(token.clone().drop_guard()));
        assert!(!token.is_cancelled());
        drop(stream);
        assert!(token.is_cancelled());
    }
}
