use super::NetError;
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{
    Certificate as RustlsCertificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig,
};
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// This replica's mTLS identity: certificate chain plus private key.
#[derive(Clone)]
pub struct TlsIdentity {
    pub chain: Vec<RustlsCertificate>,
    pub private_key: PrivateKey,
}

/// Roots that peer certificates must chain to.
#[derive(Clone)]
pub struct TlsTrustStore {
    pub roots: RootCertStore,
}

impl TlsIdentity {
    pub fn client_config(&self, trust: &TlsTrustStore) -> Result<ClientConfig, NetError> {
        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(trust.roots.clone())
            .with_client_auth_cert(self.chain.clone(), self.private_key.clone())
            .map_err(NetError::from)
    }

    /// Server side requires a client certificate: the datanode RPC surface
    /// is mutual-TLS only when security is enabled.
    pub fn server_config(&self, trust: &TlsTrustStore) -> Result<ServerConfig, NetError> {
        let verifier = Arc::new(AllowAnyAuthenticatedClient::new(trust.roots.clone()));
        ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.chain.clone(), self.private_key.clone())
            .map_err(NetError::from)
    }
}

pub fn load_identity_from_pem(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsIdentity, NetError> {
    let chain = load_cert_chain(cert_path)?;
    if chain.is_empty() {
        return Err(NetError::Certificate(
            "identity certificate chain empty".into(),
        ));
    }
    let private_key = load_private_key(key_path)?;
    Ok(TlsIdentity { chain, private_key })
}

pub fn load_trust_store_from_pem(path: impl AsRef<Path>) -> Result<TlsTrustStore, NetError> {
    let mut reader = BufReader::new(File::open(path)?);
    let raw = certs(&mut reader)
        .map_err(|_| NetError::Certificate("failed to read trust bundle".into()))?;
    if raw.is_empty() {
        return Err(NetError::Certificate("trust bundle is empty".into()));
    }
    let mut store = RootCertStore::empty();
    let (added, _skipped) = store.add_parsable_certificates(&raw);
    if added == 0 {
        return Err(NetError::Certificate(
            "no parsable certificates in trust bundle".into(),
        ));
    }
    Ok(TlsTrustStore { roots: store })
}

fn load_cert_chain(path: impl AsRef<Path>) -> Result<Vec<RustlsCertificate>, NetError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut chain = Vec::new();
    for cert in
        certs(&mut reader).map_err(|_| NetError::Certificate("invalid certificate chain".into()))?
    {
        chain.push(RustlsCertificate(cert));
    }
    Ok(chain)
}

type KeyParser = fn(&mut dyn std::io::BufRead) -> Result<Vec<Vec<u8>>, std::io::Error>;

fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKey, NetError> {
    let path = path.as_ref();
    let parsers: [KeyParser; 3] = [pkcs8_private_keys, rsa_private_keys, ec_private_keys];
    for parser in parsers {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        if let Ok(mut keys) = parser(&mut reader) {
            if let Some(key) = keys.pop() {
                return Ok(PrivateKey(key));
            }
        }
    }
    Err(NetError::Certificate(format!(
        "no usable private key in {}",
        path.display()
    )))
}
