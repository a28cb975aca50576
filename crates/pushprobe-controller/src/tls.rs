use crate::error::{ControllerError, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// TLS key material for the mutually-authenticated control channel.
///
/// One CA signs both sides: the server certificate presented by the
/// controller and the client identity the agents pick up from project
/// metadata.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub agent_cert_pem: String,
    pub agent_key_pem: String,
}

impl TlsMaterial {
    /// PEM bundle published to agents: CA trust anchor plus their identity.
    pub fn agent_bundle(&self) -> String {
        format!(
            "{}{}{}",
            self.ca_pem, self.agent_cert_pem, self.agent_key_pem
        )
    }

    /// Build the rustls server config requiring client certificates signed
    /// by the fleet CA.
    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        for cert in parse_certs(&self.ca_pem)? {
            roots
                .add(cert)
                .map_err(|e| ControllerError::boot_failure(format!("invalid CA cert: {e}")))?;
        }

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| {
                ControllerError::boot_failure(format!("failed to build client verifier: {e}"))
            })?;

        let certs = parse_certs(&self.server_cert_pem)?;
        let key = parse_key(&self.server_key_pem)?;

        rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| ControllerError::boot_failure(format!("invalid server cert/key: {e}")))
    }
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ControllerError::boot_failure(format!("failed to parse certificate: {e}")))
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ControllerError::boot_failure(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ControllerError::boot_failure("no private key found in PEM"))
}

/// Resolve TLS material for the control plane.
///
/// Existing PEM files under `data_dir` are reused so a controller restart
/// does not invalidate the identity agents already hold; otherwise a fresh
/// CA, server certificate (CN and SAN = `host_ip`), and agent identity are
/// generated and persisted.
pub fn provision_tls(data_dir: &Path, host_ip: &str) -> Result<TlsMaterial> {
    let ca_path = data_dir.join("ca.pem");
    let server_cert_path = data_dir.join("server.pem");
    let server_key_path = data_dir.join("server-key.pem");
    let agent_cert_path = data_dir.join("agent.pem");
    let agent_key_path = data_dir.join("agent-key.pem");

    let all_present = [
        &ca_path,
        &server_cert_path,
        &server_key_path,
        &agent_cert_path,
        &agent_key_path,
    ]
    .iter()
    .all(|p| p.exists());

    if all_present {
        info!("Loading existing TLS material from {}", data_dir.display());
        return Ok(TlsMaterial {
            ca_pem: read_pem(&ca_path)?,
            server_cert_pem: read_pem(&server_cert_path)?,
            server_key_pem: read_pem(&server_key_path)?,
            agent_cert_pem: read_pem(&agent_cert_path)?,
            agent_key_pem: read_pem(&agent_key_path)?,
        });
    }

    info!(
        "Generating control-channel TLS material in {}",
        data_dir.display()
    );

    std::fs::create_dir_all(data_dir).map_err(|e| {
        ControllerError::boot_failure(format!(
            "failed to create TLS directory {}: {e}",
            data_dir.display()
        ))
    })?;

    // --- CA ---
    let ca_key = KeyPair::generate()
        .map_err(|e| ControllerError::boot_failure(format!("failed to generate CA key: {e}")))?;
    let mut ca_params = CertificateParams::new(vec!["Pushprobe CA".to_string()])
        .map_err(|e| ControllerError::boot_failure(format!("invalid CA params: {e}")))?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| ControllerError::boot_failure(format!("failed to self-sign CA: {e}")))?;

    // --- Server certificate ---
    let server_key = KeyPair::generate().map_err(|e| {
        ControllerError::boot_failure(format!("failed to generate server key: {e}"))
    })?;
    let mut server_params = CertificateParams::new(vec![host_ip.to_string()])
        .map_err(|e| ControllerError::boot_failure(format!("invalid server params: {e}")))?;
    server_params
        .distinguished_name
        .push(DnType::CommonName, host_ip);
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .map_err(|e| ControllerError::boot_failure(format!("failed to sign server cert: {e}")))?;

    // --- Agent client identity ---
    let agent_key = KeyPair::generate()
        .map_err(|e| ControllerError::boot_failure(format!("failed to generate agent key: {e}")))?;
    let mut agent_params = CertificateParams::new(vec!["pushprobe-agent".to_string()])
        .map_err(|e| ControllerError::boot_failure(format!("invalid agent params: {e}")))?;
    agent_params
        .distinguished_name
        .push(DnType::CommonName, "pushprobe-agent");
    agent_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let agent_cert = agent_params
        .signed_by(&agent_key, &ca_cert, &ca_key)
        .map_err(|e| ControllerError::boot_failure(format!("failed to sign agent cert: {e}")))?;

    let material = TlsMaterial {
        ca_pem: ca_cert.pem(),
        server_cert_pem: server_cert.pem(),
        server_key_pem: server_key.serialize_pem(),
        agent_cert_pem: agent_cert.pem(),
        agent_key_pem: agent_key.serialize_pem(),
    };

    write_pem(&ca_path, &material.ca_pem)?;
    write_pem(&server_cert_path, &material.server_cert_pem)?;
    write_pem(&server_key_path, &material.server_key_pem)?;
    write_pem(&agent_cert_path, &material.agent_cert_pem)?;
    write_pem(&agent_key_path, &material.agent_key_pem)?;

    info!("TLS material written to {}", data_dir.display());
    Ok(material)
}

fn read_pem(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        ControllerError::boot_failure(format!("failed to read {}: {e}", path.display()))
    })
}

fn write_pem(path: &Path, pem: &str) -> Result<()> {
    std::fs::write(path, pem).map_err(|e| {
        ControllerError::boot_failure(format!("failed to write {}: {e}", path.display()))
    })
}
