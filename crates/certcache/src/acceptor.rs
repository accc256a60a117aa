//! TLS accept path backed by the serving cache
//!
//! rustls resolves certificates synchronously, but a cache miss has to go to
//! the store. [`CertAcceptor`] reads the ClientHello first with
//! [`LazyConfigAcceptor`], looks the certificate up asynchronously and only
//! then finishes the handshake with a config built around that certificate.

use std::io;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

use crate::serving::{CertError, CertServingCache};

/// Errors from [`CertAcceptor::accept`]
#[derive(Error, Debug)]
pub enum AcceptError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] io::Error),

    #[error("no certificate for {server_name:?}: {source}")]
    Certificate {
        server_name: String,
        #[source]
        source: CertError,
    },

    #[error("failed to build TLS config: {0}")]
    Config(#[from] rustls::Error),
}

/// Resolver that always hands out one certificate
#[derive(Debug)]
struct Resolved(Arc<CertifiedKey>);

impl ResolvesServerCert for Resolved {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Accepts TLS connections, picking the certificate by SNI
#[derive(Debug, Clone)]
pub struct CertAcceptor {
    cache: Arc<CertServingCache>,
    provider: Arc<CryptoProvider>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl CertAcceptor {
    pub fn new(cache: Arc<CertServingCache>) -> Self {
        Self {
            cache,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
            alpn_protocols: Vec::new(),
        }
    }

    /// Offer these ALPN protocols, in preference order
    pub fn with_alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    pub fn cache(&self) -> &Arc<CertServingCache> {
        &self.cache
    }

    /// Run the server side of a TLS handshake on `stream`
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>, AcceptError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
        let hello = start.client_hello();
        let server_name = hello.server_name().unwrap_or_default().to_string();

        let certificate = match self.cache.resolve_hello(&hello).await {
            Ok(certificate) => certificate,
            Err(source) => {
                warn!(server_name = %server_name, error = %source, "No certificate for handshake");
                return Err(AcceptError::Certificate {
                    server_name,
                    source,
                });
            }
        };

        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(Resolved(certificate.certified_key().clone())));
        config.alpn_protocols = self.alpn_protocols.clone();

        let tls = start.into_stream(Arc::new(config)).await?;
        debug!(server_name = %server_name, "TLS handshake completed");
        Ok(tls)
    }
}
