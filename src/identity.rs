//! Persistent node identity: a self-signed RSA certificate and its key.
//!
//! The pair is generated once and stored as PEM next to each other. There is
//! no renewal; removing the files forces a new identity on the next start.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::IdentityConfig;
use crate::error::ConfigurationError;

const VALIDITY_DAYS: i64 = 365;

/// Certificate, private key and the hostname they were issued for.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
    pub hostname: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("hostname", &self.hostname)
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn cert_der(&self) -> Result<CertificateDer<'static>, ConfigurationError> {
        CertificateDer::from_pem_slice(self.cert_pem.as_bytes()).map_err(|e| {
            ConfigurationError::Pem {
                path: PathBuf::from("<certificate>"),
                reason: e.to_string(),
            }
        })
    }

    pub fn key_der(&self) -> Result<PrivateKeyDer<'static>, ConfigurationError> {
        PrivateKeyDer::from_pem_slice(self.key_pem.as_bytes()).map_err(|e| {
            ConfigurationError::Pem {
                path: PathBuf::from("<private key>"),
                reason: e.to_string(),
            }
        })
    }
}

pub struct IdentityStore {
    dir: PathBuf,
    cert_path: PathBuf,
    key_path: PathBuf,
    hostname: String,
}

impl IdentityStore {
    pub fn new(config: &IdentityConfig, hostname: impl Into<String>) -> Self {
        Self {
            dir: config.dir.clone(),
            cert_path: config.cert_path(),
            key_path: config.key_path(),
            hostname: hostname.into(),
        }
    }

    pub fn at(dir: &Path, hostname: impl Into<String>) -> Self {
        let config = IdentityConfig {
            dir: dir.to_path_buf(),
        };
        Self::new(&config, hostname)
    }

    /// Loads the stored identity, generating and persisting one if absent.
    ///
    /// Once created, every call returns byte-identical material.
    pub fn ensure_identity(&self) -> Result<Identity, ConfigurationError> {
        if self.cert_path.exists() && self.key_path.exists() {
            tracing::info!("Certificates found in {}", self.dir.display());
            return self.load();
        }

        tracing::info!("Generating new self-signed certificate for {}", self.hostname);
        let identity = generate(&self.hostname)?;
        self.persist(&identity)?;
        tracing::info!("Certificates generated at {}", self.dir.display());
        Ok(identity)
    }

    /// Collaborator-facing name for [`IdentityStore::ensure_identity`].
    pub fn load_or_create(&self) -> Result<Identity, ConfigurationError> {
        self.ensure_identity()
    }

    fn load(&self) -> Result<Identity, ConfigurationError> {
        let cert_pem = read(&self.cert_path)?;
        let key_pem = read(&self.key_path)?;
        let identity = Identity {
            cert_pem,
            key_pem,
            hostname: self.hostname.clone(),
        };

        // Surface corrupt files now rather than at the first handshake.
        identity.cert_der().map_err(|e| relabel(e, &self.cert_path))?;
        identity.key_der().map_err(|e| relabel(e, &self.key_path))?;
        Ok(identity)
    }

    fn persist(&self, identity: &Identity) -> Result<(), ConfigurationError> {
        fs::create_dir_all(&self.dir).map_err(|source| ConfigurationError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        write(&self.key_path, &identity.key_pem)?;
        restrict_permissions(&self.key_path);
        write(&self.cert_path, &identity.cert_pem)
    }
}

fn generate(hostname: &str) -> Result<Identity, ConfigurationError> {
    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;

    let mut params = CertificateParams::new(vec![hostname.to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    dn.push(DnType::OrganizationName, "Hampter Link");
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    let cert = params.self_signed(&key_pair)?;

    Ok(Identity {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        hostname: hostname.to_string(),
    })
}

fn read(path: &Path) -> Result<String, ConfigurationError> {
    fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, content: &str) -> Result<(), ConfigurationError> {
    fs::write(path, content).map_err(|source| ConfigurationError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn relabel(err: ConfigurationError, path: &Path) -> ConfigurationError {
    match err {
        ConfigurationError::Pem { reason, .. } => ConfigurationError::Pem {
            path: path.to_path_buf(),
            reason,
        },
        other => other,
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Could not restrict permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
