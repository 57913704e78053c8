// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Relaying of established tunnel channels to their consumers
//
// Lifetime of a channel:
//
// - the transport accepts a logical channel and hands us its duplex stream
// - the caller picks a target: a remote TCP address, or the embedded SOCKS5 server
// - `dispatch` spawns one isolated task per channel
// - the relay opens the connection stats, moves bytes until both sides close, then closes them
//
// Authentication and channel multiplexing happen below this layer.

pub mod dispatch;
pub mod proxy_socks;
pub mod proxy_tcp;
pub mod socks5;
pub mod stats;

pub use dispatch::{ChannelRelay, RelayTarget, RelayTargetParseError};
pub use proxy_socks::{relay_socks, SocksServer};
pub use proxy_tcp::{relay_tcp, Dialer, TcpDialer};
pub use socks5::{Socks5Error, Socks5Server};
pub use stats::{ConnStats, ConnectionStats, TransferCounters, TransferTotals};
