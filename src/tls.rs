//! Self-signed certificate provisioning for HTTPS
//!
//! OBS and browsers require a secure context for some overlay features, so
//! the server can run HTTPS alongside HTTP with an auto-generated
//! self-signed certificate. Generated files are reused on later starts.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// Ensure a certificate/key pair exists in `cert_dir`, generating a
/// self-signed pair for `hostnames` when missing. Returns the file paths.
pub fn ensure_ssl_certs(cert_dir: &Path, hostnames: &[String]) -> Result<(PathBuf, PathBuf)> {
    let cert_path = cert_dir.join(CERT_FILE);
    let key_path = cert_dir.join(KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        return Ok((cert_path, key_path));
    }

    std::fs::create_dir_all(cert_dir).context("failed to create certificate directory")?;

    let certified = rcgen::generate_simple_self_signed(hostnames.to_vec())
        .context("failed to generate self-signed certificate")?;
    std::fs::write(&cert_path, certified.cert.pem()).context("failed to write certificate")?;
    std::fs::write(&key_path, certified.key_pair.serialize_pem())
        .context("failed to write private key")?;

    info!(
        "Generated self-signed certificate in {} for {}",
        cert_dir.display(),
        hostnames.join(", ")
    );
    Ok((cert_path, key_path))
}
