// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::common::protocol::stats::{TransferCounters, TransferTotals};

pub mod dropkick;
pub mod tunnel_stream;
pub mod validators;

const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// Copies bytes in both directions between `a` and `b` until either direction ends
///
/// Bytes read from `a` are recorded as sent, bytes read from `b` as received.
/// The first direction to finish, by end-of-stream or by error, aborts the other,
/// and both write sides are shut down. A peer that closes its stream therefore
/// ends the pipe even while the opposite peer stays open and silent.
///
/// The returned totals are also readable from `counters` while the pipe runs.
#[tracing::instrument(level = "trace", err, skip_all)]
pub async fn proxy_generic_tokio_streams<A, B>(
  a: A,
  b: B,
  counters: &TransferCounters,
) -> Result<TransferTotals, std::io::Error>
where
  A: AsyncRead + AsyncWrite,
  B: AsyncRead + AsyncWrite,
{
  let (reader_a, mut writer_a) = tokio::io::split(a);
  let (reader_b, mut writer_b) = tokio::io::split(b);
  let abort = CancellationToken::new();
  let proxy_a2b = copy_then_shutdown(reader_a, &mut writer_b, &abort, |n| counters.add_sent(n));
  let proxy_b2a = copy_then_shutdown(reader_b, &mut writer_a, &abort, |n| {
    counters.add_received(n)
  });
  tracing::trace!("polling");
  let (a_to_b, b_to_a) = futures::future::join(proxy_a2b, proxy_b2a).await;
  match a_to_b.and(b_to_a) {
    Ok(()) => Ok(counters.totals()),
    Err(e) => {
      tracing::debug!(error = ?e, "Proxy connection copy with error {:#?}", e);
      Err(e)
    }
  }
}

async fn copy_then_shutdown<R, W>(
  reader: R,
  writer: &mut W,
  abort: &CancellationToken,
  record: impl Fn(u64),
) -> Result<(), std::io::Error>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let copied = copy_until_aborted(reader, writer, abort, record).await;
  abort.cancel();
  // Failing to shut down a half that is already gone changes nothing for the caller
  let _ = writer.shutdown().await;
  copied
}

async fn copy_until_aborted<R, W>(
  mut reader: R,
  writer: &mut W,
  abort: &CancellationToken,
  record: impl Fn(u64),
) -> Result<(), std::io::Error>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; PROXY_BUFFER_CAPACITY];
  loop {
    let read = tokio::select! {
      read = reader.read(&mut buf) => read?,
      _ = abort.cancelled() => return Ok(()),
    };
    if read == 0 {
      return Ok(());
    }
    tokio::select! {
      written = writer.write_all(&buf[..read]) => written?,
      _ = abort.cancelled() => return Ok(()),
    }
    record(read as u64);
  }
}

/// Unit-scaled rendering of a byte count, such as `512B`, `1.5KB`, or `3.0MB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    const UNITS: [&str; 6] = ["KB", "MB", "GB", "TB", "PB", "EB"];
    if self.0 < 1024 {
      return write!(f, "{}B", self.0);
    }
    let mut scaled = self.0 as f64 / 1024.0;
    let mut unit = 0;
    while scaled >= 1024.0 && unit < UNITS.len() - 1 {
      scaled /= 1024.0;
      unit += 1;
    }
    write!(f, "{:.1}{}", scaled, UNITS[unit])
  }
}
