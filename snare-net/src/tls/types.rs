use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct CaMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaMaterialPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CaMaterialPaths {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join("snare-ca.pem"), dir.join("snare-ca-key.pem"))
    }
}

pub struct CaCertificate {
    pub material: CaMaterial,
    pub cert: rcgen::Certificate,
}

impl fmt::Debug for CaCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaCertificate")
            .field("material", &self.material)
            .finish_non_exhaustive()
    }
}

/// A freshly issued leaf. `chain` is `[leaf, root]` in DER form.
#[derive(Debug, Clone)]
pub struct LeafCertificate {
    pub hostname: String,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub chain: Vec<Vec<u8>>,
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TlsError {
    pub kind: TlsErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
    Rcgen,
    Io,
    OpenSsl,
    InvalidMaterial,
    MissingServerName,
}

impl fmt::Display for TlsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TlsErrorKind::Rcgen => "certificate generation failed",
            TlsErrorKind::Io => "certificate io failed",
            TlsErrorKind::OpenSsl => "openssl failed",
            TlsErrorKind::InvalidMaterial => "invalid key material",
            TlsErrorKind::MissingServerName => "missing server name (SNI)",
        };
        f.write_str(label)
    }
}

impl TlsError {
    pub fn new(kind: TlsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn rcgen(err: impl fmt::Display) -> Self {
        Self::new(TlsErrorKind::Rcgen, err.to_string())
    }

    pub(crate) fn io(err: impl fmt::Display) -> Self {
        Self::new(TlsErrorKind::Io, err.to_string())
    }
}

impl From<openssl::error::ErrorStack> for TlsError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::new(TlsErrorKind::OpenSsl, err.to_string())
    }
}
