// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Connection lifecycle accounting shared by every relay
use std::{
  fmt,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};

use crate::util::dropkick::{Dropkick, DropkickSync};

/// Bytes moved by one relayed connection
///
/// `sent` flows from the tunnel side toward the remote, `received` flows back.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferTotals {
  pub sent: u64,
  pub received: u64,
}

/// Live byte counters for one relayed connection, updated as data moves
#[derive(Debug, Default)]
pub struct TransferCounters {
  sent: AtomicU64,
  received: AtomicU64,
}

impl TransferCounters {
  pub fn add_sent(&self, bytes: u64) {
    self.sent.fetch_add(bytes, Ordering::Relaxed);
  }

  pub fn add_received(&self, bytes: u64) {
    self.received.fetch_add(bytes, Ordering::Relaxed);
  }

  pub fn totals(&self) -> TransferTotals {
    TransferTotals {
      sent: self.sent.load(Ordering::Relaxed),
      received: self.received.load(Ordering::Relaxed),
    }
  }
}

/// A sink for connection open/close transitions, shared across concurrent relays
///
/// Relays call [ConnectionStats::open] once a connection is established and
/// [ConnectionStats::close] exactly once afterward, whatever the outcome.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionStats: Send + Sync {
  fn open(&self);

  fn close(&self, totals: TransferTotals);

  /// Short rendering of the current counters, used as a log line prefix
  fn summary(&self) -> String;
}

/// Atomic connection counters, rendered as `[open/total]`
///
/// `total` counts connections that reached [ConnectionStats::open]. Channels whose
/// dial failed never open, so they appear in neither figure.
#[derive(Debug, Default)]
pub struct ConnStats {
  total: AtomicU64,
  open: AtomicU64,
  sent: AtomicU64,
  received: AtomicU64,
}

impl ConnStats {
  pub fn new() -> Self {
    Self::default()
  }

  /// Connections currently between open and close
  pub fn open_count(&self) -> u64 {
    self.open.load(Ordering::SeqCst)
  }

  /// Connections ever opened
  pub fn total_count(&self) -> u64 {
    self.total.load(Ordering::SeqCst)
  }

  /// Bytes moved by all closed connections
  pub fn totals(&self) -> TransferTotals {
    TransferTotals {
      sent: self.sent.load(Ordering::Relaxed),
      received: self.received.load(Ordering::Relaxed),
    }
  }
}

impl ConnectionStats for ConnStats {
  fn open(&self) {
    self.total.fetch_add(1, Ordering::SeqCst);
    self.open.fetch_add(1, Ordering::SeqCst);
  }

  fn close(&self, totals: TransferTotals) {
    // An unbalanced close is a caller bug; never wrap below zero because of it
    let _ = self
      .open
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
        open.checked_sub(1)
      });
    self.sent.fetch_add(totals.sent, Ordering::Relaxed);
    self.received.fetch_add(totals.received, Ordering::Relaxed);
  }

  fn summary(&self) -> String {
    self.to_string()
  }
}

impl fmt::Display for ConnStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}/{}]", self.open_count(), self.total_count())
  }
}

/// Reports the closing of a connection, with whatever its counters hold at that moment
pub(crate) struct CloseNotice<'a, C: ConnectionStats + ?Sized> {
  stats: &'a C,
  counters: Arc<TransferCounters>,
}

impl<'a, C: ConnectionStats + ?Sized> DropkickSync for CloseNotice<'a, C> {
  fn dropkick(self) {
    self.stats.close(self.counters.totals());
  }
}

/// Marks a connection open, returning a guard which marks it closed when dropped
///
/// Dropping the guard is the only way to close, so the close happens exactly once
/// on every exit path, including cancellation of the relay future and unwinding.
pub(crate) fn track_open<'a, C: ConnectionStats + ?Sized>(
  stats: &'a C,
  counters: Arc<TransferCounters>,
) -> Dropkick<CloseNotice<'a, C>> {
  stats.open();
  Dropkick::new(CloseNotice { stats, counters })
}
