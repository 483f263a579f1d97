//! Transport keypair and certificate bundle decryption
//!
//! The wire server encrypts the certificates it hands out to a self-signed
//! "transport" certificate we send along with the request. The bundle is a
//! CMS enveloped blob wrapping a password-less PKCS#12 bag; each certificate
//! in the bag is turned into an OpenSSH public key keyed by its SHA-1
//! thumbprint (uppercase hex, no colons, matching what the platform lists).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::cms::CmsContentInfo;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509Builder, X509NameBuilder};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{Dispatch, debug, info, warn};

use crate::CloudInitError;

/// Fingerprint to OpenSSH public key
pub type KeyDirectory = BTreeMap<String, String>;

const TRANSPORT_KEY_BITS: u32 = 2048;
const TRANSPORT_SUBJECT: &str = "LinuxTransport";
const TRANSPORT_VALIDITY_DAYS: u32 = 3650;
const PRIVATE_KEY_FILE: &str = "TransportPrivate.pem";
const CERTIFICATE_FILE: &str = "TransportCert.pem";

/// Normalize a fingerprint to uppercase hex without separators
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// SHA-1 thumbprint of a certificate
pub fn certificate_fingerprint(cert: &X509) -> Result<String, CloudInitError> {
    let digest = cert.digest(MessageDigest::sha1())?;
    Ok(digest.iter().map(|b| format!("{b:02X}")).collect())
}

/// OpenSSH `ssh-rsa` line for an RSA public key
pub fn ssh_rsa_public_key(rsa: &Rsa<Public>) -> String {
    let mut blob = Vec::new();
    write_ssh_string(&mut blob, b"ssh-rsa");
    write_ssh_mpint(&mut blob, &rsa.e().to_vec());
    write_ssh_mpint(&mut blob, &rsa.n().to_vec());
    format!("ssh-rsa {}", STANDARD.encode(blob))
}

fn write_ssh_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

fn write_ssh_mpint(buf: &mut Vec<u8>, magnitude: &[u8]) {
    // Positive mpints need a leading zero when the high bit is set.
    if magnitude.first().is_some_and(|b| b & 0x80 != 0) {
        buf.extend_from_slice(&(magnitude.len() as u32 + 1).to_be_bytes());
        buf.push(0);
        buf.extend_from_slice(magnitude);
    } else {
        write_ssh_string(buf, magnitude);
    }
}

struct TransportKeys {
    pkey: PKey<Private>,
    cert: X509,
    /// Certificate PEM body without armor lines or newlines
    header_value: String,
}

/// Ephemeral transport keypair plus bundle decryption
pub struct CertificateVault {
    base_dir: Option<PathBuf>,
    workdir: Option<TempDir>,
    keys: Option<TransportKeys>,
    dispatch: Dispatch,
}

impl CertificateVault {
    pub fn new() -> Self {
        Self {
            base_dir: None,
            workdir: None,
            keys: None,
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    /// Create the working directory under `dir` instead of the system temp dir
    pub fn with_base_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.base_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Working directory holding the keypair, once generated
    pub fn working_dir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(TempDir::path)
    }

    /// Certificate to send in `x-ms-guest-agent-public-x509-cert`
    ///
    /// The keypair is generated on first use and reused afterwards.
    pub fn transport_certificate(&mut self) -> Result<String, CloudInitError> {
        let dispatch = self.dispatch.clone();
        tracing::dispatcher::with_default(&dispatch, || {
            if self.keys.is_none() {
                self.generate()?;
            }
            match &self.keys {
                Some(keys) => Ok(keys.header_value.clone()),
                None => Err(CloudInitError::InvalidData(
                    "transport keypair missing after generation".to_string(),
                )),
            }
        })
    }

    fn generate(&mut self) -> Result<(), CloudInitError> {
        let rsa = Rsa::generate(TRANSPORT_KEY_BITS)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, TRANSPORT_SUBJECT)?;
        let name = name.build();

        let serial = {
            let mut bn = BigNum::new()?;
            bn.rand(159, MsbOption::MAYBE_ZERO, false)?;
            bn.to_asn1_integer()?
        };

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&pkey)?;
        let not_before = Asn1Time::days_from_now(0)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::days_from_now(TRANSPORT_VALIDITY_DAYS)?;
        builder.set_not_after(&not_after)?;
        builder.sign(&pkey, MessageDigest::sha256())?;
        let cert = builder.build();

        let cert_pem = String::from_utf8(cert.to_pem()?)
            .map_err(|e| CloudInitError::InvalidData(format!("certificate PEM: {e}")))?;
        let header_value = pem_body(&cert_pem);

        let workdir = match &self.base_dir {
            Some(dir) => tempfile::Builder::new().prefix("azure-transport").tempdir_in(dir)?,
            None => tempfile::Builder::new().prefix("azure-transport").tempdir()?,
        };
        write_private(&workdir.path().join(PRIVATE_KEY_FILE), &pkey.private_key_to_pem_pkcs8()?)?;
        fs::write(workdir.path().join(CERTIFICATE_FILE), cert_pem.as_bytes())?;

        info!("Generated transport keypair in {}", workdir.path().display());
        self.workdir = Some(workdir);
        self.keys = Some(TransportKeys {
            pkey,
            cert,
            header_value,
        });
        Ok(())
    }

    /// Decrypt a certificates document into fingerprint -> SSH key
    ///
    /// Certificates without an RSA key are skipped; everything else that goes
    /// wrong is a [`CloudInitError::CertificateDecrypt`].
    pub fn decrypt(&self, certificates_xml: &str) -> Result<KeyDirectory, CloudInitError> {
        let dispatch = self.dispatch.clone();
        tracing::dispatcher::with_default(&dispatch, || self.decrypt_bundle(certificates_xml))
    }

    fn decrypt_bundle(&self, certificates_xml: &str) -> Result<KeyDirectory, CloudInitError> {
        let keys = self.keys.as_ref().ok_or_else(|| {
            CloudInitError::CertificateDecrypt("no transport keypair generated".to_string())
        })?;

        let data = bundle_data(certificates_xml)?;
        let cipher_text = STANDARD
            .decode(data.split_whitespace().collect::<String>())
            .map_err(|e| CloudInitError::CertificateDecrypt(format!("invalid base64: {e}")))?;

        let envelope = CmsContentInfo::from_der(&cipher_text)
            .map_err(|e| CloudInitError::CertificateDecrypt(format!("invalid CMS data: {e}")))?;
        let plain = envelope
            .decrypt(&keys.pkey, &keys.cert)
            .map_err(|e| CloudInitError::CertificateDecrypt(format!("decrypt failed: {e}")))?;

        let bag = Pkcs12::from_der(&plain)
            .and_then(|p12| p12.parse2(""))
            .map_err(|e| CloudInitError::CertificateDecrypt(format!("invalid PKCS#12: {e}")))?;

        let mut certificates: Vec<X509> = bag.cert.into_iter().collect();
        if let Some(ca) = bag.ca {
            certificates.extend(ca);
        }

        let mut directory = KeyDirectory::new();
        for cert in &certificates {
            let fingerprint = certificate_fingerprint(cert)?;
            let rsa = cert.public_key().and_then(|key| key.rsa());
            match rsa {
                Ok(rsa) => {
                    debug!("Extracted SSH key for certificate {}", fingerprint);
                    directory.insert(fingerprint, ssh_rsa_public_key(&rsa));
                }
                Err(e) => warn!("Skipping certificate {} without RSA key: {}", fingerprint, e),
            }
        }

        info!(
            "Decrypted {} certificate(s), {} usable key(s)",
            certificates.len(),
            directory.len()
        );
        Ok(directory)
    }

    /// Wipe the private key and remove the working directory
    ///
    /// Safe to call repeatedly and when nothing was generated.
    pub fn cleanup(&mut self) {
        self.keys = None;
        let Some(workdir) = self.workdir.take() else {
            return;
        };

        let dispatch = self.dispatch.clone();
        tracing::dispatcher::with_default(&dispatch, || {
            let key_path = workdir.path().join(PRIVATE_KEY_FILE);
            if let Err(e) = wipe_file(&key_path) {
                warn!("Failed to wipe {}: {}", key_path.display(), e);
            }
            let path = workdir.path().to_path_buf();
            match workdir.close() {
                Ok(()) => debug!("Removed transport directory {}", path.display()),
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        });
    }
}

impl Default for CertificateVault {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CertificateVault {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Text of the `<Data>` element of a certificates document
fn bundle_data(certificates_xml: &str) -> Result<String, CloudInitError> {
    let doc = roxmltree::Document::parse(certificates_xml)
        .map_err(|e| CloudInitError::CertificateDecrypt(format!("invalid certificates XML: {e}")))?;
    doc.descendants()
        .find(|n| n.has_tag_name("Data"))
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CloudInitError::CertificateDecrypt("no <Data> in certificates".to_string()))
}

fn pem_body(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----"))
        .map(str::trim)
        .collect()
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn wipe_file(path: &Path) -> std::io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len() as usize,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(&vec![0u8; len])?;
    file.sync_all()?;
    fs::remove_file(path)
}
