//! Local certificate authority and per-hostname certificate cache
//!
//! The authority's key pair lives in the support directory (`cert.pem` and
//! `key.pem`) and is created on first start. Leaf certificates are issued on
//! demand during the TLS handshake, keyed by SNI hostname, and kept in a
//! bounded LRU cache.

use crate::error::CertError;
use chrono::{Datelike, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CA_ORGANIZATION: &str = "Developer Certificate";
const CA_COMMON_NAME: &str = "devgate CA";
const CA_VALIDITY_DAYS: i64 = 9999;

const LEAF_ORGANIZATION: &str = "devgate Signed";
const LEAF_VALIDITY_DAYS: i64 = 365;

/// The root key pair that signs every leaf certificate
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    /// The authority certificate as written on disk, sent as the chain's tail
    ca_der: CertificateDer<'static>,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish()
    }
}

impl CertificateAuthority {
    /// Load the authority from `support_dir`, generating (and optionally
    /// registering with the OS trust store) a new one if none is usable.
    pub fn load_or_generate(support_dir: &Path, trust: bool) -> Result<Self, CertError> {
        create_private_dir(support_dir)?;

        let cert_path = support_dir.join("cert.pem");
        let key_path = support_dir.join("key.pem");

        match Self::load(&cert_path, &key_path) {
            Ok(ca) => {
                info!(path = %cert_path.display(), "Existing CA found");
                return Ok(ca);
            }
            Err(e) => {
                debug!(error = %e, "No usable CA, generating a new one");
            }
        }

        let ca = Self::generate(&cert_path, &key_path)?;
        info!(path = %cert_path.display(), "Generated new CA");

        if trust {
            trust_cert(&cert_path)?;
        }

        Ok(ca)
    }

    /// Load an existing authority from PEM files
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let cert_pem = read_to_string(cert_path)?;
        let key_pem = read_to_string(key_path)?;

        let ca_key = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;

        let ca_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CertError::Pem {
                path: cert_path.display().to_string(),
                message: "no certificate found".to_string(),
            })?
            .map_err(|e| CertError::Pem {
                path: cert_path.display().to_string(),
                message: e.to_string(),
            })?;

        // Only used as the issuer of leaves: rcgen takes the subject and key
        // from it, the served chain uses the certificate read from disk.
        let ca_cert = params.self_signed(&ca_key)?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_der,
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
        })
    }

    /// Create a new authority and write it to `cert_path` / `key_path`.
    /// The key file is only readable by the owner.
    pub fn generate(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let ca_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::OrganizationName, CA_ORGANIZATION);
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());
        set_validity(&mut params, CA_VALIDITY_DAYS);

        let ca_cert = params.self_signed(&ca_key)?;

        write_file(cert_path, ca_cert.pem().as_bytes(), 0o644)?;
        write_file(key_path, ca_key.serialize_pem().as_bytes(), 0o600)?;

        Ok(Self {
            ca_der: ca_cert.der().clone(),
            ca_cert,
            ca_key,
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
        })
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// DER encoding of the authority certificate
    pub fn ca_der(&self) -> &CertificateDer<'static> {
        &self.ca_der
    }

    /// Issue a certificate for `name` signed by this authority
    pub fn issue_leaf(&self, name: &str) -> Result<Arc<CertifiedKey>, CertError> {
        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::new(vec![name.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::OrganizationName, LEAF_ORGANIZATION);
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(random_serial());
        set_validity(&mut params, LEAF_VALIDITY_DAYS);

        let leaf = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

        let key_der = PrivateKeyDer::try_from(leaf_key.serialize_der())
            .map_err(|e| CertError::SigningKey(e.to_string()))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| CertError::SigningKey(e.to_string()))?;

        let chain = vec![leaf.der().clone(), self.ca_der.clone()];
        Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
    }
}

/// Add the authority certificate to the login keychain as a trusted root
#[cfg(target_os = "macos")]
pub fn trust_cert(cert_path: &Path) -> Result<(), CertError> {
    info!("Adding certificate to login keychain as trusted");

    let keychain = dirs_next::home_dir()
        .unwrap_or_default()
        .join("Library/Keychains/login.keychain-db");

    let output = std::process::Command::new("security")
        .arg("add-trusted-cert")
        .arg("-k")
        .arg(&keychain)
        .arg(cert_path)
        .output()
        .map_err(|e| CertError::io("running security add-trusted-cert", e))?;

    if !output.status.success() {
        return Err(CertError::io(
            "running security add-trusted-cert",
            std::io::Error::new(
                std::io::ErrorKind::Other,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
        ));
    }

    info!("Certificates setup, ready for https operations!");
    Ok(())
}

/// No system trust store to manage here; point the developer at the file
#[cfg(not(target_os = "macos"))]
pub fn trust_cert(cert_path: &Path) -> Result<(), CertError> {
    info!(
        path = %cert_path.display(),
        "Add this CA certificate to your browser or system trust store to use https"
    );
    Ok(())
}

struct CacheState {
    certs: HashMap<String, Arc<CertifiedKey>>,
    /// Least recently used at the front
    order: VecDeque<String>,
}

impl CacheState {
    fn touch(&mut self, name: &str) {
        if let Some(pos) = self.order.iter().position(|n| n == name) {
            if let Some(entry) = self.order.remove(pos) {
                self.order.push_back(entry);
            }
        }
    }
}

/// SNI-keyed cache of issued leaf certificates
pub struct CertificateCache {
    ca: Arc<CertificateAuthority>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for CertificateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl CertificateCache {
    pub fn new(ca: Arc<CertificateAuthority>, capacity: usize) -> Self {
        Self {
            ca,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                certs: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The certificate for `server_name`, issuing one on a miss. Issuance
    /// happens under the cache lock.
    pub fn get_certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let name = server_name.trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() {
            return None;
        }

        let mut state = self.state.lock();
        if let Some(cert) = state.certs.get(&name).cloned() {
            state.touch(&name);
            return Some(cert);
        }

        let cert = match self.ca.issue_leaf(&name) {
            Ok(cert) => cert,
            Err(e) => {
                warn!(server_name = %name, error = %e, "Failed to issue certificate");
                return None;
            }
        };
        debug!(server_name = %name, "Issued certificate");

        while state.certs.len() >= self.capacity {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.certs.remove(&oldest);
        }
        state.certs.insert(name.clone(), Arc::clone(&cert));
        state.order.push_back(name);

        Some(cert)
    }
}

impl ResolvesServerCert for CertificateCache {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        self.get_certificate(server_name)
    }
}

/// rustls server configuration that picks certificates from `cache`
pub fn server_config(cache: Arc<CertificateCache>) -> Result<ServerConfig, rustls::Error> {
    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(cache);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Keep the DER integer positive
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    let now = Utc::now();
    let until = now + ChronoDuration::days(days);
    params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    params.not_after = rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);
}

fn create_private_dir(dir: &Path) -> Result<(), CertError> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| CertError::io(format!("creating {}", dir.display()), e))
}

fn read_to_string(path: &Path) -> Result<String, CertError> {
    std::fs::read_to_string(path).map_err(|e| CertError::io(format!("reading {}", path.display()), e))
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), CertError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|e| CertError::io(format!("writing {}", path.display()), e))?;
    file.write_all(contents)
        .map_err(|e| CertError::io(format!("writing {}", path.display()), e))
}
