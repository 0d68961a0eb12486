//! The gateway: listener loops, TLS acceptance, and the request dispatcher.

use crate::api;
use crate::config::{Config, ServiceKind};
use crate::error::{error_response, GateBody, GateError};
use crate::events::EventBus;
use crate::files;
use crate::ipfilter::IpFilter;
use crate::proxy::UpstreamProxy;
use crate::router::{Route, Router};
use crate::service::ServiceMap;
use crate::tunnel::SshTunnel;
use anyhow::Context as _;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Shared state behind every listener.
pub struct Gateway {
    router: Router,
    services: Arc<ServiceMap>,
    upstream: UpstreamProxy,
    ip_filter: IpFilter,
}

impl Gateway {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let ip_filter = IpFilter::new(&config.allowlist, &config.blocklist)?;

        let tunnels: HashMap<String, Arc<SshTunnel>> = config
            .alt_hosts
            .iter()
            .map(|(host, alt)| (host.clone(), SshTunnel::new(host.clone(), alt.ssh.clone())))
            .collect();

        let config = Arc::new(config);
        let services = Arc::new(ServiceMap::new(Arc::new(EventBus::new())));

        Ok(Arc::new(Self {
            router: Router::new(config, tunnels),
            services,
            upstream: UpstreamProxy::new(),
            ip_filter,
        }))
    }

    pub fn config(&self) -> &Arc<Config> {
        self.router.config()
    }

    pub fn services(&self) -> &Arc<ServiceMap> {
        &self.services
    }

    /// Boot-time work before the listeners accept traffic: autostart marked
    /// services (fatal on failure) and open the alt-host tunnels (the
    /// supervisor keeps retrying a tunnel that comes up and later drops, but
    /// one that never opens is only warned about).
    pub async fn start(&self) -> anyhow::Result<()> {
        self.services.autostart(self.config()).await?;

        for tunnel in self.router.tunnels() {
            if let Err(e) = tunnel.open().await {
                warn!(alt_host = %tunnel.alt_host(), error = %e, "Failed to open tunnel");
            }
        }
        Ok(())
    }

    /// Serve until the shutdown signal flips.
    pub async fn run(
        self: &Arc<Self>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let config = self.config();

        let http_listener = TcpListener::bind(&config.listen.http)
            .await
            .with_context(|| format!("binding {}", config.listen.http))?;
        info!(addr = %config.listen.http, "HTTP listener ready");

        let https = if config.tls_enabled() {
            let cert = config.ssl_certificate.as_deref().expect("checked by tls_enabled");
            let key = config
                .ssl_certificate_key
                .as_deref()
                .expect("checked by tls_enabled");
            let acceptor = build_tls_acceptor(cert, key)?;
            let listener = TcpListener::bind(&config.listen.https)
                .await
                .with_context(|| format!("binding {}", config.listen.https))?;
            info!(addr = %config.listen.https, "HTTPS listener ready");
            Some((listener, acceptor))
        } else {
            None
        };

        let http_handle = tokio::spawn(accept_loop(
            Arc::clone(self),
            http_listener,
            None,
            shutdown_rx.clone(),
        ));

        let https_handle = https.map(|(listener, acceptor)| {
            tokio::spawn(accept_loop(
                Arc::clone(self),
                listener,
                Some(acceptor),
                shutdown_rx.clone(),
            ))
        });

        let _ = http_handle.await;
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Ordered teardown: stop every service, close every tunnel, close the
    /// event bus.
    pub async fn shutdown(&self) {
        info!("Stopping all services");
        self.services.stop_all().await;

        for tunnel in self.router.tunnels() {
            tunnel.close().await;
        }

        self.services.events().close();
    }

    /// Resolve and dispatch one request.
    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
        is_tls: bool,
    ) -> Response<GateBody> {
        let forwarded_for = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());
        if !self.ip_filter.check(forwarded_for, peer.ip()) {
            debug!(%peer, "Client IP rejected");
            return error_response(GateError::IpForbidden, "Forbidden");
        }

        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string))
            .unwrap_or_default();

        let (name, service) = match self.router.resolve(&host) {
            Route::NotFound => {
                debug!(host, "No service for host");
                return error_response(GateError::RouteUnknown, "Service not found");
            }
            Route::Tunnel(tunnel) => {
                return match tunnel.forward(req).await {
                    Ok(response) => response,
                    Err(GateError::TunnelNotOpen) => {
                        error_response(GateError::TunnelNotOpen, "Tunnel not available")
                    }
                    Err(e) => error_response(e, "Bad gateway"),
                };
            }
            Route::Service(name, service) => (name, service),
        };

        let state = self.services.get_or_create(name, service);
        state.touch();

        match service.kind() {
            ServiceKind::Files => files::serve(&service.serve_files, req).await,
            ServiceKind::Api => {
                api::handle(
                    req,
                    state,
                    Arc::clone(self.config()),
                    Arc::clone(&self.services),
                )
                .await
            }
            ServiceKind::Proxy => {
                if let Err(e) = state.start().await {
                    error!(service = %name, error = %e, "Service failed to start");
                    return error_response(
                        GateError::ServiceStartFailed,
                        format!("Failed to start service: {}", e),
                    );
                }
                match self
                    .upstream
                    .forward(req, &service.forward_target(), peer, is_tls)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        error!(service = %name, error = %e, "Upstream request failed");
                        error_response(GateError::UpstreamError, "Bad gateway")
                    }
                }
            }
            // Validation rejects Unknown at load; reaching this is a bug.
            ServiceKind::Unknown => unreachable!("service kind not configured"),
        }
    }
}

async fn accept_loop(
    gateway: Arc<Gateway>,
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let gateway = Arc::clone(&gateway);
                        let tls_acceptor = tls_acceptor.clone();

                        tokio::spawn(async move {
                            if let Some(acceptor) = tls_acceptor {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        if let Err(e) = serve_connection(tls_stream, peer, gateway, true).await {
                                            debug!(%peer, error = %e, "TLS connection error");
                                        }
                                    }
                                    Err(e) => {
                                        debug!(%peer, error = %e, "TLS handshake failed");
                                    }
                                }
                            } else if let Err(e) = serve_connection(stream, peer, gateway, false).await {
                                debug!(%peer, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    gateway: Arc<Gateway>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move {
            Ok::<_, hyper::Error>(gateway.handle_request(req, peer, is_tls).await)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

/// Load the PEM certificate chain and key into a TLS acceptor.
pub fn build_tls_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS configuration error")?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("opening certificate file {}", path))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates from {}", path))?;

    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening key file {}", path))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .with_context(|| format!("parsing key from {}", path))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("no private key found in {}", path)
}
