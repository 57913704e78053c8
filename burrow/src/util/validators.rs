// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;

use crate::common::{
  identity::KeyType,
  protocol::RelayTarget,
};

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).is_file() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .with_context(|| format!("Could not resolve {:?}", v))
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

pub fn parse_relay_target(v: &str) -> Result<RelayTarget> {
  v.parse::<RelayTarget>().map_err(AnyErr::from)
}

/// Checks a key type name; RSA sizes are checked separately by [parse_key_size]
pub fn parse_key_type(v: &str) -> Result<KeyType> {
  KeyType::parse(v, "").map_err(AnyErr::from)
}

pub fn parse_key_size(v: &str) -> Result<usize> {
  match KeyType::parse("RSA", v)? {
    KeyType::Rsa { bits } => Ok(bits),
    other => Err(AnyErr::msg(format!("Expected an RSA key type, got {}", other))),
  }
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_relay_target(v: &str) -> Result<(), String> {
  parse_relay_target(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_key_type(v: &str) -> Result<(), String> {
  parse_key_type(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_key_size(v: &str) -> Result<(), String> {
  parse_key_size(v).map(|_| ()).map_err(|e| e.to_string())
}
