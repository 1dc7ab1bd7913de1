//! Test helpers

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Reader that yields some bytes and then fails, like an upload whose
/// connection drops half way through
pub struct FailingReader {
    data: &'static [u8],
}

impl FailingReader {
    pub fn new(data: &'static [u8]) -> Self {
        Self { data }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.data.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "upload interrupted",
            )));
        }
        let data = self.data;
        let n = data.len().min(buf.remaining());
        buf.put_slice(&data[..n]);
        self.data = &data[n..];
        Poll::Ready(Ok(()))
    }
}
