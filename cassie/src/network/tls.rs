//! TLS layer of driver connections.
//!
//! A [`TlsContext`] is configured once and shared by all connections. For
//! every connection it produces a [`Tls`] wrapper that knows the server name
//! to present, which for SNI endpoints routes the connection at the proxy.

use std::io;
#[cfg(feature = "rustls-023")]
use std::sync::Arc;

#[cfg(feature = "rustls-023")]
use crate::cluster::endpoint::ConnectionEndPoint;

/// Abstraction capable of producing TLS sessions for connections.
#[derive(Clone)]
#[non_exhaustive]
pub enum TlsContext {
    /// TLS context backed by Rustls 0.23.
    #[cfg(feature = "rustls-023")]
    Rustls023(Arc<rustls::ClientConfig>),
}

#[cfg(feature = "rustls-023")]
impl From<Arc<rustls::ClientConfig>> for TlsContext {
    fn from(value: Arc<rustls::ClientConfig>) -> Self {
        TlsContext::Rustls023(value)
    }
}

/// An error that occurred while setting up TLS for a connection.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum TlsError {
    #[cfg(feature = "rustls-023")]
    InvalidName(#[from] rustls::pki_types::InvalidDnsNameError),
    #[cfg(feature = "rustls-023")]
    Rustls023(#[from] rustls::Error),
}

impl From<TlsError> for io::Error {
    fn from(value: TlsError) -> Self {
        match value {
            #[cfg(feature = "rustls-023")]
            TlsError::InvalidName(e) => io::Error::other(e),
            #[cfg(feature = "rustls-023")]
            TlsError::Rustls023(e) => io::Error::other(e),
        }
    }
}

/// TLS setup of a single connection.
#[cfg(feature = "rustls-023")]
pub(crate) enum Tls {
    Rustls023 {
        connector: tokio_rustls::TlsConnector,
        server_name: rustls::pki_types::ServerName<'static>,
    },
}

#[cfg(feature = "rustls-023")]
impl TlsContext {
    pub(crate) fn new_tls(&self, endpoint: &ConnectionEndPoint) -> Result<Tls, TlsError> {
        match *self {
            TlsContext::Rustls023(ref config) => {
                use rustls::pki_types::ServerName;

                let connector = tokio_rustls::TlsConnector::from(config.clone());
                let server_name = match endpoint.server_name() {
                    Some(name) => ServerName::try_from(name)?.to_owned(),
                    None => ServerName::IpAddress(endpoint.socket_addr().ip().into()),
                };
                Ok(Tls::Rustls023 {
                    connector,
                    server_name,
                })
            }
        }
    }
}
