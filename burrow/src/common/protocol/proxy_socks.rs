// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing_futures::Instrument;

use super::stats::{track_open, ConnectionStats, TransferCounters};
use crate::util::tunnel_stream::{BoxedTunnelStream, StreamConn, TunnelStream};

/// The connection type handed to a [SocksServer]
pub type SocksConn = StreamConn<BoxedTunnelStream>;

/// A SOCKS5 server able to drive one client connection to completion
///
/// The server owns the whole protocol exchange, including the relay to
/// whichever destination the client requests.
pub trait SocksServer: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn serve_conn(&self, conn: SocksConn) -> BoxFuture<'_, Result<(), Self::Error>>;
}

/// Lets a tunnel channel act as a client connection of `server`
///
/// The connection is marked open before the server takes over and closed once it
/// returns. Server errors are reported only through `span`, never to the caller:
/// each channel is disposable, and a failed SOCKS session must not become the
/// caller's problem. Do not turn this into a `Result`.
pub async fn relay_socks<T, C, S>(span: tracing::Span, server: &T, stats: &C, source: S)
where
  T: SocksServer + ?Sized,
  C: ConnectionStats + ?Sized,
  S: TunnelStream + 'static,
{
  async move {
    let counters = Arc::new(TransferCounters::default());
    let conn = SocksConn::new(Box::new(source), Arc::clone(&counters));
    let open = track_open(stats, counters);
    tracing::debug!("{} Opening", stats.summary());
    let served = server.serve_conn(conn).await;
    drop(open);
    match served {
      Err(e) if !is_end_of_stream(&e) => {
        tracing::debug!("{}: Closed (error: {})", stats.summary(), e)
      }
      _ => tracing::debug!("{}: Closed", stats.summary()),
    }
  }
  .instrument(span)
  .await
}

/// Whether `err` only says the client went away
///
/// Servers describe a vanished peer as text ending in `EOF`, or carry an
/// [std::io::ErrorKind::UnexpectedEof] somewhere in their source chain.
pub fn is_end_of_stream(err: &(dyn std::error::Error + 'static)) -> bool {
  if err.to_string().ends_with("EOF") {
    return true;
  }
  let mut cause = Some(err);
  while let Some(current) = cause {
    if let Some(io_error) = current.downcast_ref::<std::io::Error>() {
      if io_error.kind() == std::io::ErrorKind::UnexpectedEof {
        return true;
      }
    }
    cause = current.source();
  }
  false
}

#[cfg(test)]
mod tests {
  use std::{
    io::{Error as IOError, ErrorKind},
    sync::{Arc, Mutex},
    time::Duration,
  };

  use futures::future::{BoxFuture, FutureExt};
  use mockall::Sequence;
  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

  use super::{is_end_of_stream, relay_socks, SocksConn, SocksServer};
  use crate::common::protocol::stats::{ConnStats, MockConnectionStats, TransferTotals};

  /// Echoes one message, then fails with a fixed description
  struct ScriptedServer {
    failure: Option<(ErrorKind, &'static str)>,
  }

  impl SocksServer for ScriptedServer {
    type Error = IOError;

    fn serve_conn(&self, mut conn: SocksConn) -> BoxFuture<'_, Result<(), Self::Error>> {
      async move {
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await?;
        conn.write_all(&buf).await?;
        conn.shutdown().await?;
        match self.failure {
          Some((kind, text)) => Err(IOError::new(kind, text)),
          None => Ok(()),
        }
      }
      .boxed()
    }
  }

  #[derive(Clone, Default)]
  struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

  impl std::io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
    }
  }

  /// Runs one relay against `server`, returning the captured log output
  async fn relay_logged(server: ScriptedServer) -> String {
    let logs = SharedBuffer::default();
    let subscriber = tracing_subscriber::fmt()
      .with_max_level(tracing::Level::DEBUG)
      .with_ansi(false)
      .with_writer({
        let logs = logs.clone();
        move || logs.clone()
      })
      .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let stats = ConnStats::new();
    let (source, mut client) = duplex(64);
    let relay = relay_socks(tracing::Span::none(), &server, &stats, source);
    let exchange = async {
      client.write_all(b"ping").await.unwrap();
      let mut echoed = Vec::new();
      client.read_to_end(&mut echoed).await.unwrap();
      echoed
    };
    let ((), echoed) = tokio::time::timeout(
      Duration::from_secs(10),
      futures::future::join(relay, exchange),
    )
    .await
    .expect("Relay did not complete");
    assert_eq!(echoed, b"ping");
    assert_eq!(stats.to_string(), "[0/1]");

    let captured = logs.0.lock().unwrap().clone();
    String::from_utf8(captured).unwrap()
  }

  #[tokio::test]
  async fn eof_errors_close_plainly() {
    let logs = relay_logged(ScriptedServer {
      failure: Some((ErrorKind::Other, "read tcp: EOF")),
    })
    .await;
    assert!(logs.contains("[1/1] Opening"), "{}", logs);
    assert!(logs.contains("[0/1]: Closed"), "{}", logs);
    assert!(!logs.contains("Closed (error"), "{}", logs);
  }

  #[tokio::test]
  async fn other_errors_close_with_error() {
    let logs = relay_logged(ScriptedServer {
      failure: Some((ErrorKind::Other, "connection refused by upstream")),
    })
    .await;
    assert!(
      logs.contains("[0/1]: Closed (error: connection refused by upstream)"),
      "{}",
      logs
    );
  }

  #[tokio::test]
  async fn clean_sessions_close_plainly() {
    let logs = relay_logged(ScriptedServer { failure: None }).await;
    assert!(logs.contains("[0/1]: Closed"), "{}", logs);
    assert!(!logs.contains("error"), "{}", logs);
  }

  #[tokio::test]
  async fn session_is_accounted_open_then_closed() {
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
            sent: 4,
            received: 4,
          }
      })
      .times(1)
      .in_sequence(&mut seq)
      .return_const(());
    stats.expect_summary().return_const(String::from("[1/1]"));

    let server = ScriptedServer { failure: None };
    let (source, mut client) = duplex(64);
    let relay = relay_socks(tracing::Span::none(), &server, &stats, source);
    let exchange = async {
      client.write_all(b"abcd").await.unwrap();
      let mut echoed = Vec::new();
      client.read_to_end(&mut echoed).await.unwrap();
    };
    tokio::time::timeout(
      Duration::from_secs(10),
      futures::future::join(relay, exchange),
    )
    .await
    .expect("Relay did not complete");
  }

  #[test]
  fn end_of_stream_detection() {
    let eof_text = IOError::new(ErrorKind::Other, "unexpected EOF");
    let eof_kind = IOError::new(ErrorKind::UnexpectedEof, "early eof");
    let other = IOError::new(ErrorKind::ConnectionReset, "reset by peer");
    assert!(is_end_of_stream(&eof_text));
    assert!(is_end_of_stream(&eof_kind));
    assert!(!is_end_of_stream(&other));
  }
}
