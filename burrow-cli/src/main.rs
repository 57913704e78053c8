// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use burrow::util;
use clap::{Arg, ArgGroup, ArgMatches, Command};
use std::path::PathBuf;

use util::validators::{
  parse_relay_target, parse_socketaddr, validate_existing_file, validate_key_size,
  validate_key_type, validate_relay_target, validate_socketaddr,
};

mod forward;
mod keygen;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("burrow=debug,info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let matches = cli().get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::debug!("{} exited successfully", mode),
  }
}

fn cli() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("keygen")
        .about("Generate an endpoint private key as PEM")
        .arg(
          Arg::new("seed")
            .help("Derive the key deterministically from this seed")
            .long("seed")
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("type")
            .long("type")
            .short('t')
            .validator(validate_key_type)
            .default_value("ECDSA")
            .takes_value(true),
        )
        .arg(
          Arg::new("size")
            .help("RSA modulus size in bits; defaults to 4096")
            .long("size")
            .short('s')
            .validator(validate_key_size)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("output")
            .help("Write the key here instead of stdout")
            .long("output")
            .short('o')
            .takes_value(true)
            .required(false),
        ),
    )
    .subcommand(
      Command::new("fingerprint")
        .about("Print the fingerprint of a PEM private key")
        .arg(
          Arg::new("path")
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("expect")
            .help("Fail unless the fingerprint starts with this text")
            .long("expect")
            .short('e')
            .takes_value(true)
            .required(false),
        ),
    )
    .subcommand(
      Command::new("forward")
        .about("Relay accepted TCP connections as tunnel channels")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:1080")
            .takes_value(true),
        )
        .arg(
          Arg::new("target")
            .long("target")
            .short('t')
            .validator(validate_relay_target)
            .takes_value(true),
        )
        .arg(
          Arg::new("socks")
            .help("Serve each channel with the embedded SOCKS5 server")
            .long("socks"),
        )
        .group(
          ArgGroup::new("destination")
            .args(&["target", "socks"])
            .required(true),
        )
        .arg(
          Arg::new("local-only")
            .help("Only dial loopback addresses")
            .long("local-only"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true)
}

pub fn keygen_arg_handling(args: &'_ ArgMatches) -> keygen::KeygenArgs {
  keygen::KeygenArgs {
    seed: args.value_of("seed").map(String::from),
    key_type: args.value_of("type").unwrap_or_default().into(),
    key_size: args.value_of("size").unwrap_or_default().into(),
    output: args.value_of("output").map(PathBuf::from),
  }
}

pub fn fingerprint_arg_handling(args: &'_ ArgMatches) -> keygen::FingerprintArgs {
  keygen::FingerprintArgs {
    path: PathBuf::from(args.value_of("path").unwrap_or_default()),
    expect: args.value_of("expect").map(String::from),
  }
}

pub fn forward_arg_handling(args: &'_ ArgMatches) -> Result<forward::ForwardArgs> {
  let target = match args.value_of("target") {
    Some(target) => parse_relay_target(target)?,
    None => burrow::common::protocol::RelayTarget::Socks,
  };
  Ok(forward::ForwardArgs {
    listen: parse_socketaddr(args.value_of("listen").unwrap_or_default())?,
    target,
    local_only: args.is_present("local-only"),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("keygen", opts)) => {
      let config = keygen_arg_handling(opts);
      tracing::debug!("Generating key with config {:?}", config);
      keygen::keygen_main(config).await
    }
    Some(("fingerprint", opts)) => keygen::fingerprint_main(fingerprint_arg_handling(opts)).await,
    Some(("forward", opts)) => {
      let config = forward_arg_handling(opts)?;
      tracing::info!("Forwarding with config {:#?}", config);
      forward::forward_main(config).await
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  }
}
