// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Minimal SOCKS5 server (RFC 1928): no authentication, `CONNECT` only
use std::{
  fmt,
  io::ErrorKind,
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
  proxy_socks::{SocksConn, SocksServer},
  proxy_tcp::Dialer,
  stats::TransferCounters,
};
use crate::util::proxy_generic_tokio_streams;

const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

#[derive(thiserror::Error, Debug)]
pub enum Socks5Error {
  #[error("socks5 stream failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("unsupported SOCKS version {0:#04x}")]
  InvalidVersion(u8),
  #[error("client offered no acceptable authentication method")]
  NoAcceptableMethods,
  #[error("unsupported SOCKS command {0:#04x}")]
  UnsupportedCommand(u8),
  #[error("unsupported address type {0:#04x}")]
  UnsupportedAddressType(u8),
  #[error("requested domain name is not valid UTF-8")]
  InvalidDomain,
  #[error("failed to reach {address}: {source}")]
  Dial {
    address: String,
    #[source]
    source: std::io::Error,
  },
}

/// Destination requested by a SOCKS5 client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  Ip(SocketAddr),
  Domain(String, u16),
}

impl fmt::Display for TargetAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TargetAddr::Ip(addr) => write!(f, "{}", addr),
      TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
    }
  }
}

/// Serves SOCKS5 clients by dialing their requested destinations through `D`
#[derive(Debug, Clone, Default)]
pub struct Socks5Server<D> {
  dialer: D,
}

impl<D: Dialer> Socks5Server<D> {
  pub fn new(dialer: D) -> Self {
    Self { dialer }
  }

  pub fn dialer(&self) -> &D {
    &self.dialer
  }
}

impl<D: Dialer> SocksServer for Socks5Server<D> {
  type Error = Socks5Error;

  fn serve_conn(&self, mut conn: SocksConn) -> BoxFuture<'_, Result<(), Self::Error>> {
    async move {
      negotiate_method(&mut conn).await?;
      let target = read_request(&mut conn).await?;
      let address = target.to_string();
      tracing::trace!(target = %address, "SOCKS5 connect requested");
      let dialed = self.dialer.dial("tcp", &address).await;
      let destination = match dialed {
        Ok(destination) => destination,
        Err(source) => {
          // The client may already be gone; the dial failure is the error worth reporting
          let _ = write_reply(&mut conn, reply_for_dial_error(source.kind())).await;
          return Err(Socks5Error::Dial { address, source });
        }
      };
      write_reply(&mut conn, REPLY_SUCCEEDED).await?;
      // `conn` already tallies this session for the caller
      let untracked = TransferCounters::default();
      proxy_generic_tokio_streams(conn, destination, &untracked).await?;
      Ok(())
    }
    .boxed()
  }
}

fn reply_for_dial_error(kind: ErrorKind) -> u8 {
  match kind {
    ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
    ErrorKind::PermissionDenied => REPLY_CONNECTION_NOT_ALLOWED,
    ErrorKind::InvalidInput => REPLY_GENERAL_FAILURE,
    _ => REPLY_HOST_UNREACHABLE,
  }
}

/// Reads the client greeting and selects the no-authentication method
async fn negotiate_method<S>(stream: &mut S) -> Result<(), Socks5Error>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut header = [0u8; 2];
  stream.read_exact(&mut header).await?;
  if header[0] != SOCKS5_VERSION {
    return Err(Socks5Error::InvalidVersion(header[0]));
  }
  let mut methods = vec![0u8; header[1] as usize];
  stream.read_exact(&mut methods).await?;
  if methods.contains(&METHOD_NO_AUTH) {
    stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
  } else {
    let _ = stream
      .write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE])
      .await;
    Err(Socks5Error::NoAcceptableMethods)
  }
}

/// Reads a `CONNECT` request, refusing other commands and unknown address types
async fn read_request<S>(stream: &mut S) -> Result<TargetAddr, Socks5Error>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  // VER CMD RSV ATYP
  let mut header = [0u8; 4];
  stream.read_exact(&mut header).await?;
  if header[0] != SOCKS5_VERSION {
    return Err(Socks5Error::InvalidVersion(header[0]));
  }
  if header[1] != CMD_CONNECT {
    let _ = write_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await;
    return Err(Socks5Error::UnsupportedCommand(header[1]));
  }
  let target = match header[3] {
    ATYP_IPV4 => {
      let mut octets = [0u8; 4];
      stream.read_exact(&mut octets).await?;
      let port = stream.read_u16().await?;
      TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
    }
    ATYP_IPV6 => {
      let mut octets = [0u8; 16];
      stream.read_exact(&mut octets).await?;
      let port = stream.read_u16().await?;
      TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
    }
    ATYP_DOMAIN => {
      let len = stream.read_u8().await?;
      let mut domain = vec![0u8; len as usize];
      stream.read_exact(&mut domain).await?;
      let port = stream.read_u16().await?;
      let domain = String::from_utf8(domain).map_err(|_| Socks5Error::InvalidDomain)?;
      TargetAddr::Domain(domain, port)
    }
    other => {
      let _ = write_reply(stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await;
      return Err(Socks5Error::UnsupportedAddressType(other));
    }
  };
  Ok(target)
}

/// Writes a reply carrying a zero bound address; tunnel channels have no local endpoint to report
async fn write_reply<S>(stream: &mut S, reply: u8) -> Result<(), std::io::Error>
where
  S: AsyncWrite + Unpin,
{
  stream
    .write_all(&[SOCKS5_VERSION, reply, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
    .await
}
