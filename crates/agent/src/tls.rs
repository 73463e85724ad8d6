//! TLS material shared by both transports' dialers: a `rustls::ClientConfig`
//! built from the platform's native trust store, and the `quinn` wrapper
//! QUIC needs around the same config.

use std::sync::Arc;

use rustls_pki_types::ServerName;

fn root_store() -> anyhow::Result<rustls::RootCertStore> {
	let mut roots = rustls::RootCertStore::empty();
	let loaded = rustls_native_certs::load_native_certs();
	for err in loaded.errors {
		tracing::warn!(error = %err, "skipping a native certificate");
	}
	for cert in loaded.certs {
		roots.add(cert).map_err(|e| anyhow::anyhow!("adding native root certificate: {e}"))?;
	}
	Ok(roots)
}

/// A bare rustls config with no ALPN set: the HTTP/2-framed transport
/// distinguishes itself by SNI hostname alone.
pub fn h2_client_config() -> anyhow::Result<rustls::ClientConfig> {
	let roots = root_store()?;
	Ok(rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
}

/// A `quinn::ClientConfig` with ALPN `argotunnel`, wrapping the
/// same native trust store.
pub fn quic_client_config() -> anyhow::Result<quinn::ClientConfig> {
	let roots = root_store()?;
	let mut tls = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
	tls.alpn_protocols = vec![b"argotunnel".to_vec()];
	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls).map_err(|e| anyhow::anyhow!("building quic tls config: {e}"))?;
	Ok(quinn::ClientConfig::new(Arc::new(quic_tls)))
}

pub fn server_name(hostname: &str) -> anyhow::Result<ServerName<'static>> {
	Ok(ServerName::try_from(hostname.to_string()).map_err(|e| anyhow::anyhow!("invalid server name {hostname}: {e}"))?.to_owned())
}
