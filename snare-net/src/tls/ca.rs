use std::fs;
use std::io::Write;
use std::path::Path;

use openssl::x509::X509;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};
use tracing::info;

use super::cert::random_serial;
use super::types::{CaCertificate, CaMaterial, CaMaterialPaths, TlsError, TlsErrorKind};

const DEFAULT_CA_VALIDITY_DAYS: i64 = 365;
pub(crate) const ORGANIZATION: &str = "Snare";

pub fn generate_ca(common_name: &str) -> Result<CaCertificate, TlsError> {
    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    params.serial_number = Some(random_serial()?);

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(DEFAULT_CA_VALIDITY_DAYS);

    let cert = Certificate::from_params(params).map_err(TlsError::rcgen)?;

    // Each rcgen serialize call signs again, so the PEM is derived from the
    // one DER encoding.
    let cert_der = cert.serialize_der().map_err(TlsError::rcgen)?;
    let cert_pem = X509::from_der(&cert_der)?.to_pem()?;
    let key_pem = cert.serialize_private_key_pem().into_bytes();
    let key_der = cert.serialize_private_key_der();

    Ok(CaCertificate {
        material: CaMaterial {
            cert_pem,
            key_pem,
            cert_der,
            key_der,
        },
        cert,
    })
}

/// Rebuilds a signing authority from PEM material. The certificate DER is
/// taken from the PEM as-is, so leaves chain to the exact root that clients
/// already trust.
pub fn load_ca(cert_pem: &[u8], key_pem: &[u8]) -> Result<CaCertificate, TlsError> {
    let cert_text = std::str::from_utf8(cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::InvalidMaterial, err.to_string()))?;
    let key_text = std::str::from_utf8(key_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::InvalidMaterial, err.to_string()))?;

    let key_pair = KeyPair::from_pem(key_text)
        .map_err(|err| TlsError::new(TlsErrorKind::InvalidMaterial, err.to_string()))?;
    let key_der = key_pair.serialize_der();
    let params = CertificateParams::from_ca_cert_pem(cert_text, key_pair)
        .map_err(|err| TlsError::new(TlsErrorKind::InvalidMaterial, err.to_string()))?;
    let cert = Certificate::from_params(params).map_err(TlsError::rcgen)?;
    let cert_der = X509::from_pem(cert_pem)?.to_der()?;

    Ok(CaCertificate {
        material: CaMaterial {
            cert_pem: cert_pem.to_vec(),
            key_pem: key_pem.to_vec(),
            cert_der,
            key_der,
        },
        cert,
    })
}

pub fn load_or_generate_ca(
    paths: &CaMaterialPaths,
    common_name: &str,
) -> Result<CaCertificate, TlsError> {
    if paths.cert_path.exists() && paths.key_path.exists() {
        let cert_pem = fs::read(&paths.cert_path).map_err(TlsError::io)?;
        let key_pem = fs::read(&paths.key_path).map_err(TlsError::io)?;
        let ca = load_ca(&cert_pem, &key_pem)?;
        info!(cert = %paths.cert_path.display(), "loaded root certificate");
        return Ok(ca);
    }

    let ca = generate_ca(common_name)?;
    write_ca(paths, &ca.material)?;
    info!(cert = %paths.cert_path.display(), "generated new root certificate");
    Ok(ca)
}

pub fn write_ca(paths: &CaMaterialPaths, material: &CaMaterial) -> Result<(), TlsError> {
    ensure_parent(&paths.cert_path)?;
    ensure_parent(&paths.key_path)?;

    fs::write(&paths.cert_path, &material.cert_pem).map_err(TlsError::io)?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut key_file = options.open(&paths.key_path).map_err(TlsError::io)?;
    key_file.write_all(&material.key_pem).map_err(TlsError::io)?;

    Ok(())
}

fn ensure_parent(path: &Path) -> Result<(), TlsError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir).map_err(TlsError::io),
        _ => Ok(()),
    }
}
