// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The transport collaborator (spec §6): socket read/write, generalized
//! over any `AsyncRead + AsyncWrite`, the same bound the teacher crate puts
//! on `Client<S, M>`.
//!
//! The consumed interface's `subscribe`/`unsubscribe(READ|WRITE)` has no
//! separate method here: polling with a `Context` registers the waker for
//! exactly the direction polled, which is the poll-based equivalent of an
//! explicit subscription, and is the idiomatic way to express it over
//! `tokio::io`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A transport connection to a FastCGI application.
pub trait Transport: Unpin {
    /// Attempts to read into `buf`, returning the number of bytes read (0 =
    /// peer half-closed, i.e. `is_read0` becomes true).
    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>>;

    /// Attempts to write `buf`, returning the number of bytes accepted.
    fn poll_send(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>>;

    /// Whether the peer has half-closed its write side.
    fn is_read0(&self) -> bool;

    /// Whether the transport has entered a terminal error state.
    fn is_error(&self) -> bool;
}

/// A [`Transport`] backed directly by an `AsyncRead + AsyncWrite` socket.
pub struct TokioTransport<S> {
    inner: S,
    read0: bool,
    error: bool,
}

impl<S> TokioTransport<S> {
    /// Wraps `inner` as a transport.
    pub fn new(inner: S) -> Self {
        Self { inner, read0: false, error: false }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport for TokioTransport<S> {
    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let mut read_buf = ReadBuf::new(buf);
        match Pin::new(&mut self.inner).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                if n == 0 {
                    self.read0 = true;
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                self.error = true;
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_send(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, buf) {
            Poll::Ready(Err(e)) => {
                self.error = true;
                Poll::Ready(Err(e))
            }
            other => other,
        }
    }

    fn is_read0(&self) -> bool {
        self.read0
    }

    fn is_error(&self) -> bool {
        self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn recv_reports_read0_on_half_close() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut transport = TokioTransport::new(server);
        client.write_all(b"hi").await.unwrap();
        drop(client);

        let mut buf = [0u8; 64];
        let n = poll_fn(|cx| transport.poll_recv(cx, &mut buf)).await.unwrap();
        assert_eq!(&buf[..n], b"hi");

        let n2 = poll_fn(|cx| transport.poll_recv(cx, &mut buf)).await.unwrap();
        assert_eq!(n2, 0);
        assert!(transport.is_read0());
    }
}
