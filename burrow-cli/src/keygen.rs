// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use burrow::common::identity::{generate_key, KeyMaterial};
use std::{fmt, io::Write, path::PathBuf};

/// Parameters for generating an endpoint's private key
#[derive(Eq, PartialEq, Clone)]
pub struct KeygenArgs {
  pub seed: Option<String>,
  pub key_type: String,
  pub key_size: String,
  pub output: Option<PathBuf>,
}

// The seed rebuilds the key, so it never reaches the logs
impl fmt::Debug for KeygenArgs {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeygenArgs")
      .field("seeded", &self.seed.is_some())
      .field("key_type", &self.key_type)
      .field("key_size", &self.key_size)
      .field("output", &self.output)
      .finish()
  }
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct FingerprintArgs {
  pub path: PathBuf,
  pub expect: Option<String>,
}

#[tracing::instrument(skip(config), fields(key_type = %config.key_type), err)]
pub async fn keygen_main(config: KeygenArgs) -> Result<()> {
  let KeygenArgs {
    seed,
    key_type,
    key_size,
    output,
  } = config;
  // RSA generation is CPU-bound and can take seconds
  let pem = tokio::task::spawn_blocking(move || {
    generate_key(seed.unwrap_or_default().as_bytes(), &key_type, &key_size)
  })
  .await
  .context("Key generation task panicked")?
  .context("Key generation failed")?;
  let key = KeyMaterial::from_pem(&pem).context("Generated key failed to load")?;

  match output {
    Some(path) => {
      if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Directory creation must succeed for keys")?;
      }
      std::fs::write(&path, &*pem).context("Failed writing private key")?;
      restrict_permissions(&path)?;
      tracing::info!(path = ?path, "Private key written");
    }
    None => {
      let mut stdout = std::io::stdout().lock();
      stdout.write_all(&pem).context("Failed writing private key")?;
      stdout.flush()?;
    }
  }
  tracing::info!(fingerprint = %key.fingerprint(), "Generated {} key", key.key_type());
  Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
    .context("Failed restricting private key permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> Result<()> {
  Ok(())
}

#[tracing::instrument(skip(config), fields(path = ?config.path), err)]
pub async fn fingerprint_main(config: FingerprintArgs) -> Result<()> {
  let pem = std::fs::read(&config.path).context("Failed reading private key file")?;
  let key = KeyMaterial::from_pem(&pem).context("Failed parsing private key")?;
  let fingerprint = key.fingerprint();
  println!("{}", fingerprint);
  match config.expect {
    Some(expected) if !fingerprint.matches(&expected) => Err(anyhow::Error::msg(format!(
      "Fingerprint {} does not match the expected {}",
      fingerprint, expected
    ))),
    Some(_) => {
      tracing::info!("Fingerprint matches expectation");
      Ok(())
    }
    None => Ok(()),
  }
}
