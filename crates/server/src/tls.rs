use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Where auto-generated certificates are persisted across restarts.
const STATE_DIR: &str = "/var/lib/glint";

pub struct TlsConfigResult {
    pub config: ServerConfig,
    pub cert_pem_path: String,
    pub key_pem_path: String,
}

/// Build a `rustls::ServerConfig` from the configured cert/key paths, or
/// generate and persist a self-signed localhost certificate when none are
/// given. Unreadable user-provided files are fatal.
pub fn build_tls_config(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> Result<TlsConfigResult> {
    let (certs, key, cert_pem_path, key_pem_path) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => {
            let (certs, priv_key) = load_certs_from_files(cert, key)?;
            (certs, priv_key, cert.to_string(), key.to_string())
        }
        _ => {
            let cert_pem_path = format!("{STATE_DIR}/server-cert.pem");
            let key_pem_path = format!("{STATE_DIR}/server-key.pem");

            std::fs::create_dir_all(STATE_DIR)
                .with_context(|| format!("Failed to create {STATE_DIR}"))?;

            let loaded = if Path::new(&cert_pem_path).exists() && Path::new(&key_pem_path).exists()
            {
                match load_certs_from_files(&cert_pem_path, &key_pem_path) {
                    Ok(pair) => {
                        tracing::info!("Loaded existing self-signed cert from {cert_pem_path}");
                        Some(pair)
                    }
                    Err(e) => {
                        tracing::warn!("Existing self-signed cert invalid, regenerating: {e}");
                        None
                    }
                }
            } else {
                None
            };

            let (certs, priv_key) = match loaded {
                Some(pair) => pair,
                None => {
                    let (certs, priv_key) = generate_self_signed()?;

                    let pem_data = pem::encode(&pem::Pem::new("CERTIFICATE", certs[0].to_vec()));
                    std::fs::write(&cert_pem_path, pem_data.as_bytes())
                        .context("Failed to write self-signed cert PEM")?;

                    {
                        use std::io::Write;
                        use std::os::unix::fs::OpenOptionsExt;
                        let key_bytes = match &priv_key {
                            PrivateKeyDer::Pkcs8(k) => k.secret_pkcs8_der(),
                            _ => unreachable!("generated keys are always PKCS8"),
                        };
                        let key_pem_data =
                            pem::encode(&pem::Pem::new("PRIVATE KEY", key_bytes.to_vec()));
                        std::fs::OpenOptions::new()
                            .write(true)
                            .create(true)
                            .truncate(true)
                            .mode(0o600)
                            .open(&key_pem_path)
                            .and_then(|mut f| f.write_all(key_pem_data.as_bytes()))
                            .context("Failed to write self-signed key PEM")?;
                    }

                    tracing::info!("Generated self-signed cert: {cert_pem_path} + {key_pem_path}");
                    (certs, priv_key)
                }
            };

            (certs, priv_key, cert_pem_path, key_pem_path)
        }
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;

    Ok(TlsConfigResult {
        config,
        cert_pem_path,
        key_pem_path,
    })
}

fn load_certs_from_files(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read TLS cert: {cert_path}"))?;
    let key_pem =
        std::fs::read(key_path).with_context(|| format!("Failed to read TLS key: {key_path}"))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificate PEM")?;

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("Failed to parse TLS private key PEM")?
        .context("No private key found in PEM file")?;

    tracing::info!("Loaded TLS cert from {cert_path}");
    Ok((certs, key))
}

fn generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    tracing::info!("Generating self-signed TLS certificate for localhost");

    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .context("Failed to create certificate params")?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(std::net::IpAddr::V4(
            std::net::Ipv4Addr::LOCALHOST,
        )));
    params
        .subject_alt_names
        .push(SanType::IpAddress(std::net::IpAddr::V6(
            std::net::Ipv6Addr::LOCALHOST,
        )));

    let key_pair = KeyPair::generate().context("Failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to generate self-signed certificate")?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok((vec![cert_der], key_der))
}

pub fn make_acceptor(config: ServerConfig) -> tokio_rustls::TlsAcceptor {
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}

fn latest_mtime(cert: &Path, key: &Path) -> Option<SystemTime> {
    let cert_mtime = std::fs::metadata(cert).and_then(|m| m.modified()).ok();
    let key_mtime = std::fs::metadata(key).and_then(|m| m.modified()).ok();
    match (cert_mtime, key_mtime) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Resolve when the certificate or key file changes on disk. The caller
/// stops the server so a supervisor restarts it with the new certificate.
pub async fn wait_for_cert_change(cert_path: PathBuf, key_path: PathBuf) {
    let mut baseline = latest_mtime(&cert_path, &key_path);
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let current = latest_mtime(&cert_path, &key_path);
        match (baseline, current) {
            (None, Some(_)) => baseline = current,
            (Some(b), Some(c)) if c > b => {
                tracing::info!(
                    cert = %cert_path.display(),
                    "Certificate changed on disk"
                );
                return;
            }
            _ => {}
        }
    }
}
