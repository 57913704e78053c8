// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io::{Error as IOError, ErrorKind},
  net::SocketAddr,
  sync::Arc,
};

use futures::future::{BoxFuture, FutureExt};
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tracing_futures::Instrument;

use super::stats::{track_open, ConnectionStats, TransferCounters};
use crate::util::{proxy_generic_tokio_streams, tunnel_stream::TunnelStream, ByteSize};

/// Strategy for reaching a relay destination
///
/// Exists so tests and alternate network stacks can stand in for live sockets;
/// implementations should not retry or balance between endpoints.
pub trait Dialer: Send + Sync {
  type Stream: TunnelStream + 'static;

  fn dial<'a>(
    &'a self,
    network: &'a str,
    address: &'a str,
  ) -> BoxFuture<'a, Result<Self::Stream, IOError>>;
}

/// Dials plain TCP through the tokio network stack
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
  pub local_only: bool,
}

impl TcpDialer {
  pub fn new(local_only: bool) -> Self {
    Self { local_only }
  }

  /// Resolves `address`, keeping only the families `network` allows and,
  /// when `local_only` is set, only loopback addresses
  async fn resolve(&self, network: &str, address: &str) -> Result<Vec<SocketAddr>, IOError> {
    let family_matches: fn(&SocketAddr) -> bool = match network {
      "tcp" => |_| true,
      "tcp4" => SocketAddr::is_ipv4,
      "tcp6" => SocketAddr::is_ipv6,
      other => {
        return Err(IOError::new(
          ErrorKind::InvalidInput,
          format!("unsupported network {:?}", other),
        ))
      }
    };
    let mut addrs = tokio::net::lookup_host(address)
      .await?
      .filter(family_matches)
      .collect::<Vec<_>>();
    if addrs.is_empty() {
      return Err(IOError::new(
        ErrorKind::AddrNotAvailable,
        format!("no {} addresses resolved for {}", network, address),
      ));
    }
    if self.local_only {
      addrs.retain(|addr| addr.ip().is_loopback());
      if addrs.is_empty() {
        return Err(IOError::new(
          ErrorKind::PermissionDenied,
          format!("no loopback addresses resolved for {}", address),
        ));
      }
    }
    Ok(addrs)
  }
}

impl Dialer for TcpDialer {
  type Stream = TcpStream;

  fn dial<'a>(
    &'a self,
    network: &'a str,
    address: &'a str,
  ) -> BoxFuture<'a, Result<Self::Stream, IOError>> {
    async move {
      let addrs = self.resolve(network, address).await?;
      TcpStream::connect(addrs.as_slice()).await
    }
    .boxed()
  }
}

/// Forwards a tunnel channel to `remote` over a freshly dialed TCP connection
///
/// A failed dial is logged, `source` is closed, and nothing is recorded in `stats`.
/// Otherwise the connection is marked open, bytes are copied in both directions
/// until both sides have closed, and the connection is marked closed with its totals.
///
/// Nothing is returned: every failure here belongs to this one channel, and is
/// reported only through `span`. Callers must not need to handle per-channel I/O
/// errors, so do not turn this into a `Result`.
pub async fn relay_tcp<S, C, D>(
  span: tracing::Span,
  stats: &C,
  source: S,
  remote: &str,
  dialer: &D,
) where
  S: TunnelStream,
  C: ConnectionStats + ?Sized,
  D: Dialer + ?Sized,
{
  async move {
    let mut source = source;
    let destination = match dialer.dial("tcp", remote).await {
      Ok(destination) => destination,
      Err(e) => {
        tracing::debug!("Remote failed ({})", e);
        let _ = source.shutdown().await;
        return;
      }
    };
    let counters = Arc::new(TransferCounters::default());
    let open = track_open(stats, Arc::clone(&counters));
    tracing::debug!("{}: Open", stats.summary());
    // Transfer errors end this channel only; the close line below is their report
    let _ = proxy_generic_tokio_streams(source, destination, &counters).await;
    drop(open);
    let totals = counters.totals();
    tracing::debug!(
      "{}: Close (sent {} received {})",
      stats.summary(),
      ByteSize(totals.sent),
      ByteSize(totals.received)
    );
  }
  .instrument(span)
  .await
}

#[cfg(test)]
mod tests {
  use std::{io::Error as IOError, sync::Mutex, time::Duration};

  use futures::future::{BoxFuture, FutureExt};
  use mockall::Sequence;
  use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    net::TcpListener,
  };

  use super::{relay_tcp, Dialer, TcpDialer};
  use crate::common::protocol::stats::{ConnStats, MockConnectionStats, TransferTotals};

  async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::task::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let (mut reader, mut writer) = stream.into_split();
      tokio::io::copy(&mut reader, &mut writer).await.unwrap();
      writer.shutdown().await.unwrap();
    });
    addr
  }

  #[tokio::test]
  async fn refused_dial_closes_source_without_opening() {
    let addr = {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap()
    };
    let mut stats = MockConnectionStats::new();
    stats.expect_open().never();
    stats.expect_close().never();

    let (source, mut tunnel_peer) = duplex(1024);
    relay_tcp(
      tracing::Span::none(),
      &stats,
      source,
      &addr.to_string(),
      &TcpDialer::default(),
    )
    .await;

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), tunnel_peer.read_to_end(&mut rest))
      .await
      .expect("Source stream was left open after a failed dial")
      .unwrap();
    assert_eq!(read, 0);
  }

  #[tokio::test]
  async fn refused_dial_is_not_counted() {
    let addr = {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap()
    };
    let remote = addr.to_string();
    let dialer = TcpDialer::default();
    let stats = ConnStats::new();
    let (source, _tunnel_peer) = duplex(1024);

    relay_tcp(tracing::Span::none(), &stats, source, &remote, &dialer).await;
    assert_eq!(stats.to_string(), "[0/0]");
  }

  #[tokio::test]
  async fn echo_relay_opens_then_closes_with_totals() {
    const N: usize = 100_000;
    let addr = spawn_echo_server().await;

    let mut stats = MockConnectionStats::new();
    let mut seq = Sequence::new();
    stats
      .expect_open()
      .times(1)
      .in_sequence(&mut seq)
      .return_const(());
    stats
      .expect_close()
      .withf(|totals| {
        *totals
          == TransferTotals {
            sent: N as u64,
            received: N as u64,
          }
      })
      .times(1)
      .in_sequence(&mut seq)
      .return_const(());
    stats.expect_summary().return_const(String::from("[1/1]"));

    let remote = addr.to_string();
    let dialer = TcpDialer::default();
    let (source, tunnel_peer) = duplex(4096);
    let (mut peer_r, mut peer_w) = tokio::io::split(tunnel_peer);
    let payload: Vec<u8> = (0..N).map(|i| (i % 251) as u8).collect();

    let relay = relay_tcp(tracing::Span::none(), &stats, source, &remote, &dialer);
    let exchange = async {
      let write = peer_w.write_all(&payload);
      let read = async {
        let mut echoed = vec![0u8; N];
        peer_r.read_exact(&mut echoed).await.unwrap();
        echoed
      };
      let (written, echoed) = futures::future::join(write, read).await;
      written.unwrap();
      // Everything came back; closing the channel now ends the relay
      peer_w.shutdown().await.unwrap();
      echoed
    };

    let ((), echoed) = tokio::time::timeout(
      Duration::from_secs(10),
      futures::future::join(relay, exchange),
    )
    .await
    .expect("Relay did not complete");
    assert_eq!(echoed, payload);
  }

  #[tokio::test]
  async fn shared_stats_balance_after_relay() {
    let addr = spawn_echo_server().await;
    let remote = addr.to_string();
    let dialer = TcpDialer::new(true);
    let stats = ConnStats::new();
    let (source, mut tunnel_peer) = duplex(1024);

    let relay = relay_tcp(tracing::Span::none(), &stats, source, &remote, &dialer);
    let exchange = async {
      tunnel_peer.write_all(b"ping").await.unwrap();
      let mut echoed = [0u8; 4];
      tunnel_peer.read_exact(&mut echoed).await.unwrap();
      tunnel_peer.shutdown().await.unwrap();
      echoed
    };
    let ((), echoed) = tokio::time::timeout(
      Duration::from_secs(10),
      futures::future::join(relay, exchange),
    )
    .await
    .expect("Relay did not complete");

    assert_eq!(&echoed, b"ping");
    assert_eq!(stats.to_string(), "[0/1]");
    assert_eq!(
      stats.totals(),
      TransferTotals {
        sent: 4,
        received: 4
      }
    );
  }

  #[tokio::test]
  async fn closing_source_ends_relay_while_remote_stays_silent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap().to_string();
    let (remote_closed_tx, remote_closed_rx) = tokio::sync::oneshot::channel();
    tokio::task::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      // Never writes and never closes on its own
      let mut rest = Vec::new();
      let read = stream.read_to_end(&mut rest).await;
      let _ = remote_closed_tx.send(read.map(|_| rest.len()));
    });
    let dialer = TcpDialer::default();
    let stats = ConnStats::new();
    let (source, tunnel_peer) = duplex(1024);

    let relay = relay_tcp(tracing::Span::none(), &stats, source, &remote, &dialer);
    let close_channel = async {
      tokio::time::sleep(Duration::from_millis(200)).await;
      drop(tunnel_peer);
    };
    tokio::time::timeout(
      Duration::from_secs(5),
      futures::future::join(relay, close_channel),
    )
    .await
    .expect("Relay kept running after the source stream was closed");

    assert_eq!(stats.to_string(), "[0/1]");
    let remote_read = tokio::time::timeout(Duration::from_secs(5), remote_closed_rx)
      .await
      .expect("Remote was never closed")
      .unwrap();
    assert_eq!(remote_read.unwrap(), 0);
  }

  /// Hands out one pre-built in-memory stream, remembering what was asked for
  struct MemoryDialer {
    stream: Mutex<Option<DuplexStream>>,
    requested: Mutex<Vec<(String, String)>>,
  }

  impl Dialer for MemoryDialer {
    type Stream = DuplexStream;

    fn dial<'a>(
      &'a self,
      network: &'a str,
      address: &'a str,
    ) -> BoxFuture<'a, Result<Self::Stream, IOError>> {
      self
        .requested
        .lock()
        .unwrap()
        .push((network.to_string(), address.to_string()));
      let stream = self.stream.lock().unwrap().take();
      async move {
        stream.ok_or_else(|| IOError::new(std::io::ErrorKind::ConnectionRefused, "exhausted"))
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn relay_dials_through_injected_dialer() {
    let (remote_end, mut remote_peer) = duplex(1024);
    let dialer = MemoryDialer {
      stream: Mutex::new(Some(remote_end)),
      requested: Mutex::new(Vec::new()),
    };
    let stats = ConnStats::new();
    let (source, mut tunnel_peer) = duplex(1024);

    let relay = relay_tcp(
      tracing::Span::none(),
      &stats,
      source,
      "example.invalid:443",
      &dialer,
    );
    let tunnel_side = async {
      tunnel_peer.write_all(b"hello").await.unwrap();
      let mut reply = [0u8; 6];
      tunnel_peer.read_exact(&mut reply).await.unwrap();
      tunnel_peer.shutdown().await.unwrap();
      reply
    };
    let remote_side = async {
      let mut request = [0u8; 5];
      remote_peer.read_exact(&mut request).await.unwrap();
      remote_peer.write_all(b"world!").await.unwrap();
      let mut rest = Vec::new();
      remote_peer.read_to_end(&mut rest).await.unwrap();
      assert!(rest.is_empty());
      request
    };
    let ((), reply, request) = tokio::time::timeout(
      Duration::from_secs(10),
      futures::future::join3(relay, tunnel_side, remote_side),
    )
    .await
    .expect("Relay did not complete");

    assert_eq!(&request, b"hello");
    assert_eq!(&reply, b"world!");
    assert_eq!(
      dialer.requested.lock().unwrap().as_slice(),
      &[("tcp".to_string(), "example.invalid:443".to_string())]
    );
    assert_eq!(
      stats.totals(),
      TransferTotals {
        sent: 5,
        received: 6
      }
    );
  }
}
