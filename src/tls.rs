//! TLS material handling for control and data channels.
//!
//! The daemon loads a PEM certificate and key from the configured paths.
//! When they are missing, a self-signed certificate is generated with the
//! configured subject and persisted, so FTPS works out of the box. TLS
//! 1.2 and 1.3 are offered; client certificates are not required and
//! revocation is not checked.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::TlsSettings;
use crate::error::{FtpError, FtpResult};
use crate::policy::fxp::TlsVersion;

/// Builds the server-side TLS acceptor, generating and persisting a
/// self-signed certificate on first use.
pub fn build_acceptor(settings: &TlsSettings) -> FtpResult<TlsAcceptor> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    if !settings.cert_path.exists() || !settings.key_path.exists() {
        generate_self_signed(settings)?;
    }

    let certs = load_certs(settings)?;
    let key = load_key(settings)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| FtpError::Fatal(format!("TLS config: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(settings: &TlsSettings) -> FtpResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(&settings.cert_path)?);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(FtpError::Fatal(format!(
            "no certificates in {}",
            settings.cert_path.display()
        )));
    }
    Ok(certs)
}

fn load_key(settings: &TlsSettings) -> FtpResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(&settings.key_path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| FtpError::Fatal(format!("no private key in {}", settings.key_path.display())))
}

/// Generates a self-signed certificate for the configured subject and
/// writes both PEM files.
fn generate_self_signed(settings: &TlsSettings) -> FtpResult<()> {
    let certified = rcgen::generate_simple_self_signed(vec![settings.subject.clone()])
        .map_err(|e| FtpError::Fatal(format!("certificate generation: {e}")))?;
    std::fs::write(&settings.cert_path, certified.cert.pem())?;
    std::fs::write(&settings.key_path, certified.key_pair.serialize_pem())?;
    info!(
        cert = %settings.cert_path.display(),
        subject = %settings.subject,
        "generated self-signed TLS certificate"
    );
    Ok(())
}

/// Maps a negotiated rustls protocol version onto the policy engine's
/// version type.
pub fn negotiated_version(conn: &rustls::CommonState) -> Option<TlsVersion> {
    match conn.protocol_version()? {
        rustls::ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
        rustls::ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let settings = TlsSettings {
            cert_path: dir.path().join("cert.pem"),
            key_path: dir.path().join("key.pem"),
            subject: "ftp.example.test".to_string(),
        };
        // First build generates the material.
        build_acceptor(&settings).unwrap();
        assert!(settings.cert_path.exists());
        assert!(settings.key_path.exists());
        let first = std::fs::read(&settings.cert_path).unwrap();
        // Second build loads the persisted files unchanged.
        build_acceptor(&settings).unwrap();
        assert_eq!(std::fs::read(&settings.cert_path).unwrap(), first);
    }
}
