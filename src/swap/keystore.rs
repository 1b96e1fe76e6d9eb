// src/swap/keystore.rs

//! Swap keystore
//!
//! One RSA-2048 keypair backs two certificates:
//!
//! - `fdroid`: index identity, signs `index-v1.jar`. Its SHA-256 fingerprint is
//!   what peers pin, so it is generated once and never replaced.
//! - `https`: transport identity, reissued over the same keypair whenever the
//!   local address changes (`CN=<ip>` plus an iPAddress SAN).
//!
//! The TLS resolver always answers with the transport alias, whatever the
//! client asked for. Every change is written to disk before the resolver sees
//! it, so handshakes never observe a certificate that was not persisted.

use crate::error::{Error, Result};
use crate::net::persist::write_atomic;
use parking_lot::RwLock;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::asn1::OctetString;
use x509_cert::der::{Decode, Encode};
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;
use x509_cert::Certificate;

/// Alias of the index signing identity
pub const INDEX_ALIAS: &str = "fdroid";
/// Alias of the TLS identity
pub const TRANSPORT_ALIAS: &str = "https";

const DISTINGUISHED_NAME: &str = "O=Kerplapp,OU=GuardianProject";
const KEY_BITS: usize = 2048;
const VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// =============================================================================
// On-disk format
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    alias: String,
    /// PKCS#8 PEM
    private_key: String,
    certificate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    address: Option<IpAddr>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredKeyStore {
    #[serde(default)]
    entries: Vec<StoredEntry>,
}

// =============================================================================
// Identities
// =============================================================================

/// A private key with its self-signed certificate
pub struct Identity {
    key: RsaPrivateKey,
    certificate_der: Vec<u8>,
    address: Option<IpAddr>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn certificate_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.certificate_der.clone()))
    }

    /// Lowercase hex SHA-256 of the certificate DER
    pub fn fingerprint(&self) -> String {
        certificate_fingerprint(&self.certificate_der)
    }

    /// Address embedded in a transport certificate
    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }

    fn to_stored(&self, alias: &str) -> Result<StoredEntry> {
        let private_key = self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Crypto(format!("Failed to encode private key: {e}")))?;
        Ok(StoredEntry {
            alias: alias.to_string(),
            private_key: private_key.to_string(),
            certificate: self.certificate_pem(),
            address: self.address,
        })
    }

    fn from_stored(entry: &StoredEntry) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(&entry.private_key)
            .map_err(|e| Error::KeyStore(format!("Bad private key for '{}': {e}", entry.alias)))?;
        let certificate = pem::parse(&entry.certificate)
            .map_err(|e| Error::KeyStore(format!("Bad certificate for '{}': {e}", entry.alias)))?;
        Certificate::from_der(certificate.contents())
            .map_err(|e| Error::KeyStore(format!("Bad certificate for '{}': {e}", entry.alias)))?;
        Ok(Self {
            key,
            certificate_der: certificate.into_contents(),
            address: entry.address,
        })
    }

    fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        let der = self
            .key
            .to_pkcs8_der()
            .map_err(|e| Error::Crypto(format!("Failed to encode private key: {e}")))?;
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der.as_bytes().to_vec()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| Error::Crypto(format!("Unusable TLS key: {e}")))?;
        Ok(Arc::new(CertifiedKey::new(
            vec![CertificateDer::from(self.certificate_der.clone())],
            signing_key,
        )))
    }
}

/// Lowercase hex SHA-256 of a DER certificate
pub fn certificate_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn random_serial() -> Result<SerialNumber> {
    let mut bytes: [u8; 16] = rand::random();
    // Positive and without a leading zero octet
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    SerialNumber::new(&bytes).map_err(|e| Error::Crypto(format!("Bad serial number: {e}")))
}

fn crypto(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Crypto(format!("{what}: {e}"))
}

fn self_signed(key: &RsaPrivateKey, subject: &str, address: Option<IpAddr>) -> Result<Vec<u8>> {
    let subject = Name::from_str(subject).map_err(|e| crypto("Bad subject", e))?;
    let validity = Validity::from_now(VALIDITY).map_err(|e| crypto("Bad validity", e))?;
    let spki = SubjectPublicKeyInfoOwned::from_key(key.to_public_key())
        .map_err(|e| crypto("Bad public key", e))?;
    let signer = SigningKey::<Sha256>::new(key.clone());

    // Peers pin the fingerprint, so a self-issued root is all that is needed
    let mut builder = CertificateBuilder::new(
        Profile::Root,
        random_serial()?,
        validity,
        subject,
        spki,
        &signer,
    )
    .map_err(|e| crypto("Certificate builder", e))?;

    if let Some(address) = address {
        let octets = match address {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        let san = OctetString::new(octets).map_err(|e| crypto("Bad address", e))?;
        builder
            .add_extension(&SubjectAltName(vec![GeneralName::IpAddress(san)]))
            .map_err(|e| crypto("Subject alternative name", e))?;
    }

    let certificate = builder
        .build::<Signature>()
        .map_err(|e| crypto("Signing certificate", e))?;
    certificate.to_der().map_err(|e| crypto("Encoding certificate", e))
}

// =============================================================================
// TLS certificate selection
// =============================================================================

/// Always serves the transport identity
#[derive(Debug, Default)]
pub struct TransportResolver {
    current: RwLock<Option<Arc<CertifiedKey>>>,
}

impl TransportResolver {
    fn replace(&self, key: Option<Arc<CertifiedKey>>) {
        *self.current.write() = key;
    }

    pub fn is_ready(&self) -> bool {
        self.current.read().is_some()
    }
}

impl ResolvesServerCert for TransportResolver {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current.read().clone()
    }
}

// =============================================================================
// Keystore
// =============================================================================

pub struct KeyStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Arc<Identity>>>,
    resolver: Arc<TransportResolver>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("path", &self.path)
            .field("aliases", &self.entries.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KeyStore {
    /// Load `path`, creating the index identity if the file or alias is missing
    ///
    /// An unreadable keystore is an error rather than being replaced: peers
    /// pinned the old fingerprint.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let stored = if path.exists() {
            debug!("[swap] Loading keystore {}", path.display());
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::KeyStore(format!("Cannot read {}: {e}", path.display())))?;
            toml::from_str::<StoredKeyStore>(&text)
                .map_err(|e| Error::KeyStore(format!("Cannot parse {}: {e}", path.display())))?
        } else {
            debug!("[swap] No keystore at {}, creating one", path.display());
            StoredKeyStore::default()
        };

        let mut entries = BTreeMap::new();
        for entry in &stored.entries {
            entries.insert(entry.alias.clone(), Arc::new(Identity::from_stored(entry)?));
        }

        let store = Self {
            path,
            entries: RwLock::new(entries),
            resolver: Arc::new(TransportResolver::default()),
        };

        if !store.entries.read().contains_key(INDEX_ALIAS) {
            info!("[swap] Generating {}-bit index signing key", KEY_BITS);
            let key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
                .map_err(|e| Error::Crypto(format!("Key generation failed: {e}")))?;
            let certificate_der = self_signed(&key, DISTINGUISHED_NAME, None)?;
            store.put(
                INDEX_ALIAS,
                Identity {
                    key,
                    certificate_der,
                    address: None,
                },
            )?;
        }

        if let Some(transport) = store.get(TRANSPORT_ALIAS) {
            store.resolver.replace(Some(transport.certified_key()?));
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn get(&self, alias: &str) -> Option<Arc<Identity>> {
        self.entries.read().get(alias).cloned()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Identity used to sign the repository index
    pub fn index_identity(&self) -> Result<Arc<Identity>> {
        self.get(INDEX_ALIAS)
            .ok_or_else(|| Error::KeyStore(format!("Alias '{INDEX_ALIAS}' missing")))
    }

    pub fn transport_identity(&self) -> Option<Arc<Identity>> {
        self.get(TRANSPORT_ALIAS)
    }

    /// Fingerprint peers pin for this repository
    pub fn fingerprint(&self) -> Result<String> {
        Ok(self.index_identity()?.fingerprint())
    }

    /// Issue the transport certificate for `address`
    ///
    /// A no-op when the current certificate already names `address`. The index
    /// identity is never touched.
    pub fn set_transport_address(&self, address: IpAddr) -> Result<Arc<Identity>> {
        if let Some(current) = self.transport_identity()
            && current.address == Some(address)
        {
            return Ok(current);
        }

        let index = self.index_identity()?;
        let subject = format!("CN={address},{DISTINGUISHED_NAME}");
        let identity = Identity {
            key: index.key.clone(),
            certificate_der: self_signed(&index.key, &subject, Some(address))?,
            address: Some(address),
        };
        let certified = identity.certified_key()?;
        let identity = self.put(TRANSPORT_ALIAS, identity)?;
        self.resolver.replace(Some(certified));
        info!("[swap] Transport certificate issued for {}", address);
        Ok(identity)
    }

    /// Insert under the write lock and persist before releasing it
    fn put(&self, alias: &str, identity: Identity) -> Result<Arc<Identity>> {
        let identity = Arc::new(identity);
        let mut entries = self.entries.write();
        let previous = entries.insert(alias.to_string(), Arc::clone(&identity));
        if let Err(e) = self.save(&entries) {
            match previous {
                Some(p) => entries.insert(alias.to_string(), p),
                None => entries.remove(alias),
            };
            return Err(e);
        }
        Ok(identity)
    }

    fn save(&self, entries: &BTreeMap<String, Arc<Identity>>) -> Result<()> {
        let stored = StoredKeyStore {
            entries: entries
                .iter()
                .map(|(alias, identity)| identity.to_stored(alias))
                .collect::<Result<_>>()?,
        };
        let text = toml::to_string_pretty(&stored)
            .map_err(|e| Error::KeyStore(format!("Cannot serialize keystore: {e}")))?;
        write_atomic(&self.path, text.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600)) {
                warn!("[swap] Cannot restrict {}: {}", self.path.display(), e);
            }
        }
        debug!("[swap] Saved keystore {}", self.path.display());
        Ok(())
    }

    pub fn resolver(&self) -> Arc<TransportResolver> {
        Arc::clone(&self.resolver)
    }

    /// TLS configuration serving the transport identity
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        if !self.resolver.is_ready() {
            return Err(Error::KeyStore("No transport certificate issued yet".into()));
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Crypto(format!("TLS setup failed: {e}")))?
            .with_no_client_auth()
            .with_cert_resolver(self.resolver());
        Ok(Arc::new(config))
    }

    /// RSA PKCS#1 v1.5 / SHA-256 signature with the index key
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let identity = self.index_identity()?;
        let signer = SigningKey::<Sha256>::new(identity.key.clone());
        let signature = signer
            .try_sign(data)
            .map_err(|e| Error::Crypto(format!("Signing failed: {e}")))?;
        Ok(signature.to_vec())
    }
}

/// Check `signature` over `data` against the key in a DER certificate
pub fn verify_signature(certificate_der: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
    let certificate = Certificate::from_der(certificate_der)
        .map_err(|e| Error::Crypto(format!("Bad certificate: {e}")))?;
    let spki = certificate
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::Crypto(format!("Bad public key: {e}")))?;
    let public_key = RsaPublicKey::from_public_key_der(&spki)
        .map_err(|e| Error::Crypto(format!("Not an RSA key: {e}")))?;
    let signature = Signature::try_from(signature)
        .map_err(|e| Error::Crypto(format!("Malformed signature: {e}")))?;
    VerifyingKey::<Sha256>::new(public_key)
        .verify(data, &signature)
        .map_err(|_| Error::Crypto("Signature does not match".into()))
}
