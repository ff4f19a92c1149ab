use std::net::IpAddr;

use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType, SerialNumber,
};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use super::ca::ORGANIZATION;
use super::types::{CaCertificate, LeafCertificate, TlsError, TlsErrorKind};

const LEAF_VALIDITY_SKEW_HOURS: i64 = 24;
const SERIAL_LEN: usize = 20;

/// Signs per-host leaf certificates with a single root.
///
/// Every leaf shares one key pair generated at construction. Leaves are not
/// cached; each call to [`LeafIssuer::issue`] returns a certificate with a new
/// random serial.
pub struct LeafIssuer {
    ca: CaCertificate,
    key_der: Vec<u8>,
}

impl LeafIssuer {
    pub fn new(ca: CaCertificate) -> Result<Self, TlsError> {
        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256).map_err(TlsError::rcgen)?;
        Ok(Self {
            ca,
            key_der: key_pair.serialize_der(),
        })
    }

    pub fn ca(&self) -> &CaCertificate {
        &self.ca
    }

    /// PKCS#8 DER of the key shared by all issued leaves.
    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    pub fn issue(&self, hostname: &str) -> Result<LeafCertificate, TlsError> {
        let host = strip_port(hostname);
        if host.is_empty() {
            return Err(TlsError::new(
                TlsErrorKind::MissingServerName,
                "empty hostname",
            ));
        }

        let key_pair = KeyPair::from_der(&self.key_der).map_err(TlsError::rcgen)?;

        let mut params = CertificateParams::new(Vec::new());
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.key_pair = Some(key_pair);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;
        params.serial_number = Some(random_serial()?);

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(LEAF_VALIDITY_SKEW_HOURS);
        params.not_after = now + Duration::hours(LEAF_VALIDITY_SKEW_HOURS);

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(host.to_string()));
        }

        let cert = Certificate::from_params(params).map_err(TlsError::rcgen)?;
        let cert_der = cert
            .serialize_der_with_signer(&self.ca.cert)
            .map_err(TlsError::rcgen)?;

        debug!(host, "issued leaf certificate");

        Ok(LeafCertificate {
            hostname: host.to_string(),
            chain: vec![cert_der.clone(), self.ca.material.cert_der.clone()],
            cert_der,
            key_der: self.key_der.clone(),
        })
    }
}

/// Drops a trailing `:port` and IPv6 brackets from a host string.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        };
    }
    match host.rsplit_once(':') {
        // A bare IPv6 literal has more than one colon and no port.
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

pub(crate) fn random_serial() -> Result<SerialNumber, TlsError> {
    let mut bytes = vec![0u8; SERIAL_LEN];
    openssl::rand::rand_bytes(&mut bytes)?;
    // Keep the serial positive when encoded as a DER integer.
    bytes[0] &= 0x7f;
    if bytes[0] == 0 {
        bytes[0] = 0x01;
    }
    Ok(SerialNumber::from(bytes))
}
