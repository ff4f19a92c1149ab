mod ca;
mod cert;
mod openssl;
mod types;

pub use ca::{generate_ca, load_ca, load_or_generate_ca, write_ca};
pub use cert::{LeafIssuer, strip_port};
pub use openssl::{ALPN_HTTP11, TlsConfig, build_acceptor, build_connector};
pub use types::{
    CaCertificate, CaMaterial, CaMaterialPaths, LeafCertificate, TlsError, TlsErrorKind,
};
