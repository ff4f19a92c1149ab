mod tls;

pub use tls::{
    ALPN_HTTP11, CaCertificate, CaMaterial, CaMaterialPaths, LeafCertificate, LeafIssuer,
    TlsConfig, TlsError, TlsErrorKind, build_acceptor, build_connector, generate_ca, load_ca,
    load_or_generate_ca, strip_port, write_ca,
};
