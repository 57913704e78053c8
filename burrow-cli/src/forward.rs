// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Error as AnyErr, Result};
use burrow::common::protocol::{ChannelRelay, ConnStats, RelayTarget, Socks5Server, TcpDialer};
use futures::{future, TryStreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

/// Parameters for relaying locally accepted TCP connections as tunnel channels
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ForwardArgs {
  pub listen: SocketAddr,
  pub target: RelayTarget,
  pub local_only: bool,
}

/// Accepts TCP connections on `listen` and relays each one to the target until SIGINT
#[tracing::instrument(
skip(config),
fields(
listen=%config.listen,
target=%config.target,
local_only=config.local_only,
),
err
)]
pub async fn forward_main(config: ForwardArgs) -> Result<()> {
  let listener = TcpListener::bind(config.listen)
    .await
    .context("Failed binding listener")?;
  tracing::info!(addr = %listener.local_addr()?, "Accepting channels");

  let relay = ChannelRelay::new(
    Arc::new(ConnStats::new()),
    Arc::new(TcpDialer::new(config.local_only)),
    Arc::new(Socks5Server::new(TcpDialer::new(config.local_only))),
  );

  let accept_loop = TcpListenerStream::new(listener)
    .map_err(AnyErr::from)
    .try_for_each(|stream| {
      tracing::trace!(peer = ?stream.peer_addr().ok(), "Accepted channel");
      // Channel tasks outlive their handles; failures stay inside them
      drop(relay.spawn(stream, config.target.clone()));
      future::ready(Ok(()))
    });

  tokio::select! {
    res = accept_loop => res.context("Failure running acceptance loop")?,
    _ = tokio::signal::ctrl_c() => tracing::trace!("SIGINT detected, shutting down"),
  }
  tracing::info!(stats = %relay.stats(), "Stopped accepting channels");
  Ok(())
}
