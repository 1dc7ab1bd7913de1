//! Adapters between HTTP bodies and the stash's byte streams

use axum::body::Bytes;
use file_stash::Delivery;
use futures::Stream;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

const CHUNK_SIZE: usize = 8192;

/// `AsyncRead` over a stream of byte chunks, used to hand an upload part
/// to the stash without buffering it in memory
pub struct ChunkReader<S> {
    stream: S,
    chunk: Bytes,
    done: bool,
}

impl<S> ChunkReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            chunk: Bytes::new(),
            done: false,
        }
    }
}

impl<S, E> AsyncRead for ChunkReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.chunk.is_empty() {
                let n = self.chunk.len().min(buf.remaining());
                let head = self.chunk.split_to(n);
                buf.put_slice(&head);
                return Poll::Ready(Ok(()));
            }
            if self.done {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut self.stream).poll_next(cx)) {
                Some(Ok(chunk)) => self.chunk = chunk,
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
                None => self.done = true,
            }
        }
    }
}

/// Response body stream for a delivery. The delivery is dropped when the
/// stream ends or when the client goes away, whichever comes first.
pub fn delivery_stream(delivery: Delivery) -> impl Stream<Item = io::Result<Bytes>> + Send {
    futures::stream::try_unfold(delivery, next_chunk)
}

async fn next_chunk(mut delivery: Delivery) -> io::Result<Option<(Bytes, Delivery)>> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let n = delivery.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some((Bytes::from(buf), delivery)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_chunk_reader_concatenates_chunks() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"hel")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"lo")),
        ];
        let mut reader = ChunkReader::new(stream::iter(chunks));

        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_chunk_reader_surfaces_stream_errors() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ];
        let mut reader = ChunkReader::new(stream::iter(chunks));

        let mut data = Vec::new();
        let err = reader.read_to_end(&mut data).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }
}
