// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  fmt,
  str::FromStr,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};

use tokio::task::JoinHandle;

use super::{
  proxy_socks::{relay_socks, SocksServer},
  proxy_tcp::{relay_tcp, Dialer},
  stats::ConnectionStats,
};
use crate::util::tunnel_stream::TunnelStream;

/// Where a tunnel channel's bytes should go
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelayTarget {
  /// A remote TCP endpoint, as `host:port`
  Tcp(String),
  /// The embedded SOCKS5 server
  Socks,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayTargetParseError {
  #[error("relay target is empty")]
  Empty,
  #[error("relay target {0:?} must be \"socks\" or host:port")]
  MissingPort(String),
  #[error("relay target {0:?} does not end in a valid port number")]
  InvalidPort(String),
}

impl FromStr for RelayTarget {
  type Err = RelayTargetParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    if s.is_empty() {
      return Err(RelayTargetParseError::Empty);
    }
    if s.eq_ignore_ascii_case("socks") {
      return Ok(RelayTarget::Socks);
    }
    match s.rsplit_once(':') {
      Some((host, port)) if !host.is_empty() => port
        .parse::<u16>()
        .map(|_| RelayTarget::Tcp(s.to_string()))
        .map_err(|_| RelayTargetParseError::InvalidPort(s.to_string())),
      _ => Err(RelayTargetParseError::MissingPort(s.to_string())),
    }
  }
}

impl fmt::Display for RelayTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RelayTarget::Tcp(remote) => f.write_str(remote),
      RelayTarget::Socks => f.write_str("socks"),
    }
  }
}

/// Starts one isolated relay task per accepted tunnel channel
///
/// Channels share only the stats sink, the dialer, and the SOCKS server.
pub struct ChannelRelay<C: ?Sized, D, S> {
  stats: Arc<C>,
  dialer: Arc<D>,
  socks: Arc<S>,
  next_channel: AtomicU64,
}

impl<C: ?Sized, D, S> fmt::Debug for ChannelRelay<C, D, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChannelRelay")
      .field("next_channel", &self.next_channel)
      .finish_non_exhaustive()
  }
}

impl<C, D, S> ChannelRelay<C, D, S>
where
  C: ConnectionStats + ?Sized + 'static,
  D: Dialer + 'static,
  S: SocksServer + 'static,
{
  pub fn new(stats: Arc<C>, dialer: Arc<D>, socks: Arc<S>) -> Self {
    Self {
      stats,
      dialer,
      socks,
      next_channel: AtomicU64::new(1),
    }
  }

  pub fn stats(&self) -> &Arc<C> {
    &self.stats
  }

  /// Relays `stream` to `target` on a task of its own
  ///
  /// The returned handle may be dropped; the task runs to completion regardless.
  /// Its output carries no error on purpose: whatever goes wrong inside one
  /// channel, including a panicking SOCKS server, is logged and stays inside
  /// that task, so sibling channels and the caller carry on untouched.
  pub fn spawn<T>(&self, stream: T, target: RelayTarget) -> JoinHandle<()>
  where
    T: TunnelStream + 'static,
  {
    let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
    let span = tracing::debug_span!("channel", id, %target);
    let stats = Arc::clone(&self.stats);
    let dialer = Arc::clone(&self.dialer);
    let socks = Arc::clone(&self.socks);
    tokio::task::spawn(async move {
      match target {
        RelayTarget::Tcp(remote) => relay_tcp(span, &*stats, stream, &remote, &*dialer).await,
        RelayTarget::Socks => relay_socks(span, &*socks, &*stats, stream).await,
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use std::{io::Error as IOError, sync::Arc, time::Duration};

  use futures::future::{BoxFuture, FutureExt};
  use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
  };

  use super::{ChannelRelay, RelayTarget, RelayTargetParseError};
  use crate::common::protocol::{
    proxy_socks::{SocksConn, SocksServer},
    proxy_tcp::TcpDialer,
    socks5::Socks5Server,
    stats::{ConnStats, ConnectionStats},
  };

  struct PanickingServer;

  impl SocksServer for PanickingServer {
    type Error = IOError;

    fn serve_conn(&self, conn: SocksConn) -> BoxFuture<'_, Result<(), Self::Error>> {
      async move {
        let _conn = conn;
        panic!("scripted server failure")
      }
      .boxed()
    }
  }

  #[test]
  fn relay_targets_parse() {
    assert_eq!("socks".parse(), Ok(RelayTarget::Socks));
    assert_eq!(" SOCKS ".parse(), Ok(RelayTarget::Socks));
    assert_eq!(
      "example.com:443".parse(),
      Ok(RelayTarget::Tcp("example.com:443".into()))
    );
    assert_eq!(
      "[::1]:22".parse(),
      Ok(RelayTarget::Tcp("[::1]:22".into()))
    );
    assert_eq!(
      "".parse::<RelayTarget>(),
      Err(RelayTargetParseError::Empty)
    );
    assert_eq!(
      "example.com".parse::<RelayTarget>(),
      Err(RelayTargetParseError::MissingPort("example.com".into()))
    );
    assert_eq!(
      ":80".parse::<RelayTarget>(),
      Err(RelayTargetParseError::MissingPort(":80".into()))
    );
    assert_eq!(
      "example.com:http".parse::<RelayTarget>(),
      Err(RelayTargetParseError::InvalidPort("example.com:http".into()))
    );
  }

  #[tokio::test]
  async fn failing_channels_do_not_disturb_siblings() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = listener.local_addr().unwrap();
    tokio::task::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let (mut reader, mut writer) = stream.into_split();
      tokio::io::copy(&mut reader, &mut writer).await.unwrap();
      writer.shutdown().await.unwrap();
    });
    let refused_addr = {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap()
    };

    let relay = ChannelRelay::new(
      Arc::new(ConnStats::new()),
      Arc::new(TcpDialer::default()),
      Arc::new(PanickingServer),
    );

    let (refused_source, mut refused_peer) = duplex(1024);
    let (panicking_source, _panicking_peer) = duplex(1024);
    let (echo_source, mut echo_peer) = duplex(1024);
    let refused = relay.spawn(refused_source, RelayTarget::Tcp(refused_addr.to_string()));
    let panicked = relay.spawn(panicking_source, RelayTarget::Socks);
    let echoed = relay.spawn(echo_source, RelayTarget::Tcp(echo_addr.to_string()));

    let exchange = async {
      echo_peer.write_all(b"still here").await.unwrap();
      let mut reply = [0u8; 10];
      echo_peer.read_exact(&mut reply).await.unwrap();
      echo_peer.shutdown().await.unwrap();
      reply
    };
    let reply = tokio::time::timeout(Duration::from_secs(10), exchange)
      .await
      .expect("Echo channel did not complete");
    assert_eq!(&reply, b"still here");

    refused.await.expect("Refused channel must not fail its task");
    assert!(panicked.await.unwrap_err().is_panic());
    echoed.await.expect("Echo channel must not fail its task");

    let mut rest = Vec::new();
    assert_eq!(refused_peer.read_to_end(&mut rest).await.unwrap(), 0);
    // The refused channel never opened; the panicking one still closed
    assert_eq!(relay.stats().summary(), "[0/2]");
  }

  #[tokio::test]
  async fn socks_channels_reach_the_embedded_server() {
    let relay = ChannelRelay::new(
      Arc::new(ConnStats::new()),
      Arc::new(TcpDialer::default()),
      Arc::new(Socks5Server::new(TcpDialer::default())),
    );
    let (source, mut client) = duplex(1024);
    let handle = relay.spawn(source, RelayTarget::Socks);

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);
    drop(client);

    tokio::time::timeout(Duration::from_secs(10), handle)
      .await
      .expect("SOCKS channel did not complete")
      .unwrap();
    assert_eq!(relay.stats().summary(), "[0/1]");
  }
}
