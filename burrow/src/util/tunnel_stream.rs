// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::protocol::stats::TransferCounters;

/// A duplex stream abstracting over a tunnel channel, allowing use of memory streams and sockets alike
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized {}

/// A boxed [TunnelStream], as handed to consumers that should not care about the transport
pub type BoxedTunnelStream = Box<dyn TunnelStream + 'static>;

pin_project! {
  /// Presents a tunnel stream as a network connection
  ///
  /// Reads and writes pass straight through to the wrapped stream and are tallied
  /// into `counters`: bytes read from the tunnel count as sent, bytes written back
  /// into it count as received. The stream has no real endpoints, so both address
  /// accessors report `0.0.0.0:0`.
  pub struct StreamConn<S> {
    #[pin]
    inner: S,
    counters: Arc<TransferCounters>,
  }
}

impl<S> StreamConn<S> {
  pub fn new(inner: S, counters: Arc<TransferCounters>) -> Self {
    Self { inner, counters }
  }

  pub fn local_addr(&self) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
  }

  pub fn peer_addr(&self) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
  }

  pub fn counters(&self) -> &Arc<TransferCounters> {
    &self.counters
  }

  pub fn into_inner(self) -> S {
    self.inner
  }
}

impl<S: AsyncRead> AsyncRead for StreamConn<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = self.project();
    let filled_before = buf.filled().len();
    let polled = this.inner.poll_read(cx, buf);
    if let Poll::Ready(Ok(())) = polled {
      this
        .counters
        .add_sent((buf.filled().len() - filled_before) as u64);
    }
    polled
  }
}

impl<S: AsyncWrite> AsyncWrite for StreamConn<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    let this = self.project();
    let polled = this.inner.poll_write(cx, buf);
    if let Poll::Ready(Ok(written)) = polled {
      this.counters.add_received(written as u64);
    }
    polled
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    self.project().inner.poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

  use super::{BoxedTunnelStream, StreamConn};
  use crate::common::protocol::stats::{TransferCounters, TransferTotals};

  #[tokio::test]
  async fn stream_conn_counts_both_directions() {
    let (near, mut far) = duplex(256);
    let counters = Arc::new(TransferCounters::default());
    let boxed: BoxedTunnelStream = Box::new(near);
    let mut conn = StreamConn::new(boxed, Arc::clone(&counters));

    far.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    conn.write_all(b"hi!").await.unwrap();
    conn.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    far.read_to_end(&mut echoed).await.unwrap();

    assert_eq!(&buf, b"hello");
    assert_eq!(echoed, b"hi!");
    assert_eq!(
      counters.totals(),
      TransferTotals {
        sent: 5,
        received: 3
      }
    );
    assert!(conn.local_addr().ip().is_unspecified());
    assert_eq!(conn.peer_addr().port(), 0);
  }
}
