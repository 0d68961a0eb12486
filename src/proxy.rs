//! Single-host reverse proxying to a service's `forwards_to` upstream, plus
//! the shared HTTP/1 client plumbing the tunnel module reuses.

use crate::error::GateBody;
use anyhow::Context;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Idle connections kept per upstream host.
const POOL_MAX_IDLE_PER_HOST: usize = 10;
/// Idle connection lifetime in the pool.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Pooled HTTP client used for every proxied request.
///
/// Plain-HTTP upstreams go through the shared connection pool; TLS upstreams
/// get a per-request handshake (they are the exception among local backends).
pub struct UpstreamProxy {
    client: Client<HttpConnector, Incoming>,
    tls: TlsConnector,
}

impl Default for UpstreamProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamProxy {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Self {
            client,
            tls: tls_connector(false),
        }
    }

    /// Forward a request to `target` (a URL or host:port with the scheme
    /// already defaulted), injecting the forwarded-client headers.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        target: &str,
        peer: SocketAddr,
        is_tls: bool,
    ) -> anyhow::Result<Response<GateBody>> {
        let upstream: Uri = target
            .parse()
            .with_context(|| format!("invalid upstream target {}", target))?;
        let host = upstream
            .host()
            .with_context(|| format!("upstream target {} has no host", target))?
            .to_string();
        let https = upstream.scheme_str() == Some("https");
        let port = upstream.port_u16().unwrap_or(if https { 443 } else { 80 });
        let authority = format!("{}:{}", host, port);

        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        inject_forwarded_headers(&mut parts.headers, peer, is_tls);

        // The inbound Host header would otherwise reach the backend verbatim;
        // replace it so the backend sees its own authority.
        parts.headers.insert(
            HOST,
            HeaderValue::from_str(&authority).context("invalid upstream authority")?,
        );

        debug!(method = %parts.method, target, "Forwarding to upstream");

        let response = if https {
            parts.uri = path_and_query
                .parse()
                .context("rebuilding upstream URI")?;

            let stream = TcpStream::connect(&authority)
                .await
                .with_context(|| format!("connecting to upstream {}", authority))?;
            let name =
                ServerName::try_from(host.clone()).context("invalid upstream TLS name")?;
            let stream = self
                .tls
                .connect(name, stream)
                .await
                .context("upstream TLS handshake")?;
            http1_exchange(TokioIo::new(stream), Request::from_parts(parts, body)).await?
        } else {
            parts.uri = Uri::builder()
                .scheme("http")
                .authority(authority.as_str())
                .path_and_query(path_and_query.as_str())
                .build()
                .context("rebuilding upstream URI")?;

            self.client
                .request(Request::from_parts(parts, body))
                .await
                .with_context(|| format!("upstream request to {} failed", target))?
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Add the standard forwarded-client headers.
///
/// `X-Forwarded-For` appends the connection peer to whatever chain arrived;
/// `X-Real-IP` carries the raw peer address; `X-Forwarded-Proto` reflects
/// whether the inbound leg was TLS.
pub fn inject_forwarded_headers(headers: &mut hyper::HeaderMap, peer: SocketAddr, is_tls: bool) {
    let peer_ip = peer.ip().to_string();
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, peer_ip),
        _ => peer_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }

    if let Ok(value) = HeaderValue::from_str(&peer.to_string()) {
        headers.insert("x-real-ip", value);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));
}

/// Run one HTTP/1 request over an established connection, driving the
/// connection in the background.
pub(crate) async fn http1_exchange<S>(
    io: S,
    req: Request<Incoming>,
) -> anyhow::Result<Response<Incoming>>
where
    S: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("HTTP handshake failed")?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Client connection ended");
        }
    });
    sender.send_request(req).await.context("request failed")
}

/// Build a TLS connector; `insecure` swaps in a verifier that accepts any
/// certificate.
pub(crate) fn tls_connector(insecure: bool) -> TlsConnector {
    let config = if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// Certificate verifier that accepts everything (INSECURE); only reachable
/// through an explicit `insecure_skip_verify_tls` in the config.
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
