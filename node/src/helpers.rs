//! Node identity management.
//!
//! A single Ed25519 key is both the Iroh transport identity and the receipt
//! signer, so the peer an uplink talked to is provably the node that signed
//! its upload receipt. The seed lives in `identity.key` under the data
//! directory, created with owner-only permissions on first start. A seed of
//! the wrong length is refused rather than repaired; regenerating silently
//! would orphan every piece addressed to the old identity.

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use iroh::SecretKey;
use std::path::Path;
use tracing::info;

const IDENTITY_FILE: &str = "identity.key";

/// Load the node identity, creating one on first start.
pub async fn load_keypair(data_dir: &Path) -> Result<SecretKey> {
    let path = data_dir.join(IDENTITY_FILE);
    match tokio::fs::read(&path).await {
        Ok(raw) => {
            let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!(
                    "identity file {} holds {} bytes, want a 32-byte Ed25519 seed",
                    path.display(),
                    raw.len()
                )
            })?;
            Ok(SecretKey::from_bytes(&seed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = create_identity(&path).await?;
            info!(path = %path.display(), node_id = %key.public(), "Created node identity");
            Ok(key)
        }
        Err(e) => {
            Err(e).with_context(|| format!("reading node identity from {}", path.display()))
        }
    }
}

async fn create_identity(path: &Path) -> Result<SecretKey> {
    let mut seed = [0u8; 32];
    getrandom::fill(&mut seed)?;
    let key = SecretKey::from_bytes(&seed);
    tokio::fs::write(path, key.to_bytes())
        .await
        .with_context(|| format!("writing node identity to {}", path.display()))?;

    // The seed is private key material: owner read/write only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("restricting identity file permissions")?;
    }

    Ok(key)
}

/// The receipt signing key backing the same identity as the transport key.
pub fn signing_key(secret: &SecretKey) -> SigningKey {
    SigningKey::from_bytes(&secret.to_bytes())
}
