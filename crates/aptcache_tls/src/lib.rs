#![deny(missing_docs)]

//! TLS Interception CA: mints short-lived leaf certificates on demand for
//! MITM interception of CONNECT tunnels, backed by a configured intermediate
//! CA (spec.md §4.9).
//!
//! There is no interception CA in the teacher repo (it is a client-only
//! dependency resolver with no TLS-terminating server); this crate is
//! grounded instead on the wider example pack's proxy-shaped repos for the
//! `rcgen` + `rustls` combination used here.

mod extensions;
mod key;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use rcgen::{CertificateParams, Issuer, KeyPair, SanType};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Leaf certificate validity window (spec.md §4.9 step 3, "a short window").
const LEAF_VALIDITY: ChronoDuration = ChronoDuration::days(30);

/// How close to expiry an entry must be before [`CertificateAuthority::gc`]
/// evicts it.
const GC_HORIZON: ChronoDuration = ChronoDuration::minutes(1);

/// How long a caller waits for a concurrent mint of the same SNI before
/// giving up and minting itself (spec.md §4.9 "further callers ... wait
/// briefly").
const MINT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const MINT_WAIT_POLL: Duration = Duration::from_millis(20);

/// Errors constructing or operating the CA.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The intermediate certificate PEM did not parse.
    #[error("failed to parse intermediate CA certificate: {0}")]
    CertParse(#[source] rcgen::Error),
    /// The intermediate key PEM did not parse (after decryption, if any).
    #[error("failed to parse intermediate CA key: {0}")]
    KeyParse(#[source] rcgen::Error),
    /// A PEM block wasn't in a format this loader understands.
    #[error("unrecognised PEM key format")]
    KeyFormat,
    /// The key was `ENCRYPTED PRIVATE KEY` but no passphrase was given.
    #[error("encrypted CA key requires a passphrase")]
    MissingPassphrase,
    /// PKCS#8 decryption failed (wrong passphrase or corrupt key).
    #[error("failed to decrypt CA key")]
    KeyDecrypt,
    /// Minting a leaf certificate failed.
    #[error("failed to mint leaf certificate for {0}: {1}")]
    Mint(String, #[source] rcgen::Error),
    /// Reading a CA material file from disk failed.
    #[error("failed to read {0}: {1}")]
    Io(std::path::PathBuf, #[source] std::io::Error),
}

/// A minted leaf certificate plus its chain and private key, ready to hand
/// to a TLS acceptor.
#[derive(Clone)]
pub struct IssuedCertificate {
    /// `[leaf, intermediate, root]` DER chain (root omitted if unconfigured).
    pub chain_der: Vec<CertificateDer<'static>>,
    /// The leaf's private key, DER-encoded PKCS#8.
    pub key_der: PrivatePkcs8KeyDer<'static>,
    /// When this leaf expires.
    pub expires: DateTime<Utc>,
}

impl IssuedCertificate {
    /// Clones the private key into an owned [`PrivateKeyDer`] for handing to
    /// a `rustls::ServerConfig`.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }
}

enum Slot {
    Ready(Arc<IssuedCertificate>),
    /// A mint for this SNI is already underway; other callers poll-wait
    /// rather than duplicate the work (spec.md §4.9 invariant).
    InProgress,
}

/// Intermediate-CA-backed leaf minter with an SNI-keyed cache
/// (spec.md §4.9, §5 "TLS cert storage — single read/write mutex").
pub struct CertificateAuthority {
    issuer_key: KeyPair,
    issuer_cert_pem: String,
    root_cert_pem: Option<String>,
    default_domain: String,
    aia_url: Option<String>,
    crl_url: Option<String>,
    entries: RwLock<HashMap<String, Slot>>,
    next_serial: AtomicU64,
}

impl CertificateAuthority {
    /// Parses the intermediate cert/key (and optional root, kept only for
    /// chain export) and builds a CA ready to mint leaves.
    ///
    /// `key_pem` may be RSA PKCS#1, EC SEC1, PKCS#8 unencrypted, or PKCS#8
    /// encrypted (in which case `key_passphrase` is required).
    pub fn new(
        intermediate_cert_pem: String,
        key_pem: &str,
        key_passphrase: Option<&str>,
        root_cert_pem: Option<String>,
        default_domain: String,
        aia_url: Option<String>,
        crl_url: Option<String>,
    ) -> Result<Self, TlsError> {
        let issuer_key = key::load_key_pair(key_pem, key_passphrase)?;
        warn_if_expiring_soon(&intermediate_cert_pem);
        let mut seed_bytes = [0u8; 8];
        rand::rng().fill(&mut seed_bytes);
        Ok(Self {
            issuer_key,
            issuer_cert_pem: intermediate_cert_pem,
            root_cert_pem,
            default_domain,
            aia_url,
            crl_url,
            entries: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(u64::from_be_bytes(seed_bytes)),
        })
    }

    /// Loads the intermediate cert and key PEM from disk before calling
    /// [`CertificateAuthority::new`] (spec.md §6 `https.cert`/`https.key`).
    pub fn from_files(
        cert_path: &Path,
        key_path: &Path,
        key_passphrase: Option<&str>,
        root_cert_path: Option<&Path>,
        default_domain: String,
        aia_url: Option<String>,
        crl_url: Option<String>,
    ) -> Result<Self, TlsError> {
        let cert_pem = std::fs::read_to_string(cert_path)
            .map_err(|e| TlsError::Io(cert_path.to_path_buf(), e))?;
        let key_pem = std::fs::read_to_string(key_path)
            .map_err(|e| TlsError::Io(key_path.to_path_buf(), e))?;
        let root_pem = root_cert_path
            .map(std::fs::read_to_string)
            .transpose()
            .map_err(|e| TlsError::Io(root_cert_path.unwrap().to_path_buf(), e))?;
        Self::new(
            cert_pem,
            &key_pem,
            key_passphrase,
            root_pem,
            default_domain,
            aia_url,
            crl_url,
        )
    }

    /// The intermediate certificate PEM, served verbatim at
    /// `/_goaptcacher/goaptcacher.crt`.
    pub fn intermediate_cert_pem(&self) -> &str {
        &self.issuer_cert_pem
    }

    /// Returns the cached leaf for `sni`, minting one on demand if absent.
    /// Concurrent callers for the same SNI observe the in-progress mint and
    /// poll-wait for it rather than mint a duplicate leaf (spec.md §4.9
    /// invariant).
    pub fn get_certificate(&self, sni: &str) -> Result<Arc<IssuedCertificate>, TlsError> {
        loop {
            {
                let mut entries = self.entries.write().unwrap();
                match entries.get(sni) {
                    Some(Slot::Ready(cert)) => return Ok(cert.clone()),
                    Some(Slot::InProgress) => {}
                    None => {
                        entries.insert(sni.to_string(), Slot::InProgress);
                        drop(entries);
                        return self.mint_and_store(sni);
                    }
                }
            }
            std::thread::sleep(MINT_WAIT_POLL);
            if let Some(Slot::Ready(cert)) = self.entries.read().unwrap().get(sni) {
                return Ok(cert.clone());
            }
        }
    }

    /// Async variant of [`CertificateAuthority::get_certificate`] for
    /// callers on a Tokio runtime, so the poll-wait doesn't block a worker
    /// thread.
    pub async fn get_certificate_async(&self, sni: &str) -> Result<Arc<IssuedCertificate>, TlsError> {
        let deadline = tokio::time::Instant::now() + MINT_WAIT_TIMEOUT;
        loop {
            {
                let mut entries = self.entries.write().unwrap();
                match entries.get(sni) {
                    Some(Slot::Ready(cert)) => return Ok(cert.clone()),
                    Some(Slot::InProgress) => {}
                    None => {
                        entries.insert(sni.to_string(), Slot::InProgress);
                        drop(entries);
                        return self.mint_and_store(sni);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return self.mint_and_store(sni);
            }
            tokio::time::sleep(MINT_WAIT_POLL).await;
        }
    }

    fn mint_and_store(&self, sni: &str) -> Result<Arc<IssuedCertificate>, TlsError> {
        let issued = Arc::new(self.mint(sni)?);
        self.entries
            .write()
            .unwrap()
            .insert(sni.to_string(), Slot::Ready(issued.clone()));
        Ok(issued)
    }

    /// Mints a fresh leaf for `sni` (spec.md §4.9 `mint(sni)`).
    pub fn mint(&self, sni: &str) -> Result<IssuedCertificate, TlsError> {
        let default_host = self
            .default_domain
            .rsplit_once(':')
            .map(|(host, _port)| host)
            .unwrap_or(&self.default_domain);

        let mut san_names = Vec::new();
        let mut san_ips = Vec::new();
        for host in [sni, default_host] {
            if let Ok(ip) = host.parse::<IpAddr>() {
                san_ips.push(ip);
            } else {
                san_names.push(host.to_string());
            }
        }
        san_names.sort();
        san_names.dedup();
        san_ips.sort();
        san_ips.dedup();

        let mut params = CertificateParams::new(san_names.clone())
            .map_err(|e| TlsError::Mint(sni.to_string(), e))?;
        for ip in &san_ips {
            params.subject_alt_names.push(SanType::IpAddress(*ip));
        }
        params.not_before = Utc::now().into();
        params.not_after = (Utc::now() + LEAF_VALIDITY).into();
        params.serial_number = Some(self.next_serial.fetch_add(1, Ordering::Relaxed).into());

        let mut extra_extensions = Vec::new();
        if let Some(aia_url) = &self.aia_url {
            extra_extensions.push(extensions::authority_info_access(aia_url));
        }
        if let Some(crl_url) = &self.crl_url {
            extra_extensions.push(extensions::crl_distribution_point(crl_url));
        }
        params.custom_extensions = extra_extensions;

        let leaf_key =
            KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|e| TlsError::Mint(sni.to_string(), e))?;
        let issuer = Issuer::from_ca_cert_pem(&self.issuer_cert_pem, self.issuer_key.clone_key())
            .map_err(|e| TlsError::Mint(sni.to_string(), e))?;
        let leaf_cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| TlsError::Mint(sni.to_string(), e))?;

        let mut chain_der = vec![CertificateDer::from(leaf_cert.der().to_vec())];
        chain_der.push(CertificateDer::from(
            rustls_pemfile::certs(&mut self.issuer_cert_pem.as_bytes())
                .next()
                .and_then(Result::ok)
                .map(|der| der.to_vec())
                .unwrap_or_default(),
        ));
        if let Some(root_pem) = &self.root_cert_pem {
            if let Some(Ok(root_der)) = rustls_pemfile::certs(&mut root_pem.as_bytes()).next() {
                chain_der.push(CertificateDer::from(root_der.to_vec()));
            }
        }

        Ok(IssuedCertificate {
            chain_der,
            key_der: PrivatePkcs8KeyDer::from(leaf_key.serialize_der()),
            expires: Utc::now() + LEAF_VALIDITY,
        })
    }

    /// Evicts every entry whose leaf expires within [`GC_HORIZON`] of now
    /// (spec.md §4.9 `gc()`). Returns the number evicted.
    pub fn gc(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, slot| match slot {
            Slot::Ready(cert) => cert.expires - now > GC_HORIZON,
            Slot::InProgress => true,
        });
        before - entries.len()
    }

    /// Spawns the periodic 5-minute GC task (spec.md §4.9 "Invoked
    /// periodically (every 5 min)").
    pub fn spawn_gc(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5 * 60)).await;
                let evicted = self.gc();
                if evicted > 0 {
                    tracing::debug!(count = evicted, "evicted expired TLS leaf certificates");
                }
            }
        })
    }

    /// Generates an empty CRL signed by the intermediate key and writes it
    /// to `out_path` (spec.md §4.9 `generate_crl`). The current core does
    /// not track revocations, so the list is always empty.
    pub fn generate_crl(&self, out_path: &Path) -> Result<(), TlsError> {
        let issuer = Issuer::from_ca_cert_pem(&self.issuer_cert_pem, self.issuer_key.clone_key())
            .map_err(|e| TlsError::Mint("<crl>".to_string(), e))?;
        let revoked = rcgen::CertificateRevocationListParams {
            this_update: Utc::now().into(),
            next_update: (Utc::now() + ChronoDuration::days(7)).into(),
            crl_number: rcgen::SerialNumber::from(self.next_serial.load(Ordering::Relaxed)),
            issuing_distribution_point: None,
            revoked_certs: Vec::new(),
            key_identifier_method: rcgen::KeyIdMethod::Sha256,
        };
        let crl = revoked
            .signed_by(&issuer)
            .map_err(|e| TlsError::Mint("<crl>".to_string(), e))?;
        std::fs::write(out_path, crl.pem())
            .map_err(|e| TlsError::Io(out_path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Logs a warning if the intermediate CA certificate's `notAfter` is within
/// 30 days, so an operator notices before clients start seeing broken
/// chains. Parse failures are ignored here; [`key::load_key_pair`] already
/// validates the key half of the pair.
fn warn_if_expiring_soon(cert_pem: &str) {
    let Some(der) = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .next()
        .and_then(Result::ok)
    else {
        return;
    };
    let Ok((_, parsed)) = x509_parser::parse_x509_certificate(&der) else {
        return;
    };
    let not_after = parsed.validity().not_after;
    let remaining = not_after.timestamp() - Utc::now().timestamp();
    if remaining < 30 * 24 * 60 * 60 {
        tracing::warn!(
            not_after = %not_after,
            "intermediate CA certificate expires soon"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> CertificateAuthority {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.distinguished_name = {
            let mut dn = rcgen::DistinguishedName::new();
            dn.push(rcgen::DnType::CommonName, "test intermediate CA");
            dn
        };
        let cert = params.self_signed(&key).unwrap();
        CertificateAuthority::new(
            cert.pem(),
            &key.serialize_pem(),
            None,
            None,
            "cache.example".to_string(),
            Some("https://cache.example/_goaptcacher/goaptcacher.crt".to_string()),
            Some("https://cache.example/_goaptcacher/revocation.crl".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn mints_a_leaf_for_sni() {
        let ca = test_ca();
        let cert = ca.mint("archive.ubuntu.com").unwrap();
        assert!(!cert.chain_der.is_empty());
        assert!(cert.expires > Utc::now());
    }

    #[test]
    fn get_certificate_caches_by_sni() {
        let ca = test_ca();
        let first = ca.get_certificate("security.ubuntu.com").unwrap();
        let second = ca.get_certificate("security.ubuntu.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn gc_evicts_only_near_expiry_entries() {
        let ca = test_ca();
        let _ = ca.get_certificate("deb.debian.org").unwrap();
        assert_eq!(ca.gc(), 0);
    }
}
