//! TLS origination for `https://` backends.
//!
//! The proxy never terminates TLS itself; it only initiates HTTPS
//! connections to backends, verifying them against the Mozilla root
//! store bundled by [`webpki_roots`].

use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;

use crate::dns::HostResolver;

/// Builds an HTTPS connector for outbound connections to backends.
///
/// The resulting connector supports both `http://` and `https://`
/// schemes; plain HTTP connections pass through unmodified. The server
/// name is always taken from the URI, so hosts reached through an IP
/// override in `resolver` are still verified against their hostname.
pub fn build_https_connector(
    resolver: HostResolver,
) -> hyper_rustls::HttpsConnector<HttpConnector<HostResolver>> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let mut http = HttpConnector::new_with_resolver(resolver);
    http.enforce_http(false);

    HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connector_builds_with_bundled_roots() {
        let connector = build_https_connector(HostResolver::new());
        let client: hyper_util::client::legacy::Client<_, http_body_util::Empty<bytes::Bytes>> =
            hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
                .build(connector);
        drop(client);
    }
}
