use std::sync::Arc;

use openssl::pkey::PKey;
use openssl::ssl::{
    AlpnError, NameType, SniError, SslAcceptor, SslAcceptorBuilder, SslAlert, SslConnector,
    SslMethod, SslOptions, SslVerifyMode, SslVersion, select_next_proto,
};
use openssl::x509::X509;
use tracing::warn;

use super::cert::LeafIssuer;
use super::types::TlsError;

/// Wire-format ALPN list. Only HTTP/1.1 is offered.
pub const ALPN_HTTP11: &[u8] = b"\x08http/1.1";

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub allow_legacy: bool,
}

/// Builds the client-facing acceptor. The leaf for each handshake is issued
/// from the SNI name; a handshake without SNI is refused.
pub fn build_acceptor(config: &TlsConfig, issuer: Arc<LeafIssuer>) -> Result<SslAcceptor, TlsError> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;

    apply_legacy(&mut builder, config.allow_legacy)?;

    let root = X509::from_der(&issuer.ca().material.cert_der)?;
    builder.add_extra_chain_cert(root)?;
    builder.set_verify(SslVerifyMode::NONE);

    builder.set_alpn_select_callback(|_, client| {
        select_next_proto(ALPN_HTTP11, client).ok_or(AlpnError::NOACK)
    });

    builder.set_servername_callback(move |ssl, alert| {
        let Some(name) = ssl.servername(NameType::HOST_NAME).map(str::to_owned) else {
            *alert = SslAlert::UNRECOGNIZED_NAME;
            return Err(SniError::ALERT_FATAL);
        };

        let leaf = match issuer.issue(&name) {
            Ok(leaf) => leaf,
            Err(err) => {
                warn!(host = %name, error = %err, "leaf issue failed");
                *alert = SslAlert::ILLEGAL_PARAMETER;
                return Err(SniError::ALERT_FATAL);
            }
        };

        let installed = X509::from_der(&leaf.cert_der).and_then(|cert| {
            let key = PKey::private_key_from_pkcs8(&leaf.key_der)?;
            ssl.set_certificate(&cert)?;
            ssl.set_private_key(&key)
        });
        installed.map_err(|err| {
            warn!(host = %name, error = %err, "leaf install failed");
            *alert = SslAlert::ILLEGAL_PARAMETER;
            SniError::ALERT_FATAL
        })
    });

    Ok(builder.build())
}

/// Builds the upstream-facing connector. With `verify` off, any server
/// certificate is accepted.
pub fn build_connector(verify: bool) -> Result<SslConnector, TlsError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    if !verify {
        builder.set_verify(SslVerifyMode::NONE);
    }
    builder.set_alpn_protos(ALPN_HTTP11)?;
    Ok(builder.build())
}

fn apply_legacy(builder: &mut SslAcceptorBuilder, allow_legacy: bool) -> Result<(), TlsError> {
    if allow_legacy {
        builder.set_options(SslOptions::NO_TICKET);
        builder.set_min_proto_version(Some(SslVersion::TLS1))?;
        builder.set_cipher_list("ALL:@SECLEVEL=0")?;
    } else {
        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    }
    Ok(())
}
