//! Alt-host tunnels: a supervised `ssh -L` child exposing a remote HTTP
//! endpoint through a local Unix-domain socket, with HTTP relayed over that
//! socket per request.

use crate::config::{with_http_scheme, SshTunnelConfig};
use crate::error::{GateBody, GateError};
use crate::proxy::{http1_exchange, tls_connector};
use anyhow::Context;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

/// How long `open` waits for ssh to create the forwarding socket.
const SOCKET_WAIT_DEADLINE: Duration = Duration::from_secs(10);
/// Poll interval while waiting for the socket file.
const SOCKET_WAIT_INTERVAL: Duration = Duration::from_millis(100);
/// Pause between an ssh exit and the reconnect attempt.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Where the tunnel terminates on the remote side.
#[derive(Debug, Clone)]
struct RemoteEndpoint {
    host: String,
    port: u16,
    https: bool,
}

impl RemoteEndpoint {
    fn parse(forwards_to: &str) -> anyhow::Result<Self> {
        let target = with_http_scheme(forwards_to);
        let uri: Uri = target
            .parse()
            .with_context(|| format!("parsing tunnel target {}", forwards_to))?;
        let https = uri.scheme_str() == Some("https");
        let host = uri
            .host()
            .with_context(|| format!("tunnel target {} has no host", forwards_to))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        Ok(Self { host, port, https })
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything `forward` needs, cloned out of the state so requests do not
/// hold the tunnel lock while relaying.
#[derive(Clone)]
struct Forwarder {
    socket_path: PathBuf,
    remote: RemoteEndpoint,
    tls: Option<TlsConnector>,
}

struct TunnelInner {
    stopped: bool,
    child_pid: Option<u32>,
    socket_dir: Option<TempDir>,
    forwarder: Option<Forwarder>,
}

/// A supervised SSH tunnel for one alt-host.
///
/// `open` is idempotent and re-entered by the supervisor task after the ssh
/// child exits; the supervisor never holds the state lock across that call.
pub struct SshTunnel {
    alt_host: String,
    config: SshTunnelConfig,
    inner: Mutex<TunnelInner>,
}

impl SshTunnel {
    pub fn new(alt_host: impl Into<String>, config: SshTunnelConfig) -> Arc<Self> {
        Arc::new(Self {
            alt_host: alt_host.into(),
            config,
            inner: Mutex::new(TunnelInner {
                stopped: false,
                child_pid: None,
                socket_dir: None,
                forwarder: None,
            }),
        })
    }

    pub fn alt_host(&self) -> &str {
        &self.alt_host
    }

    /// Spawn the ssh child and wait for its forwarding socket.
    ///
    /// A tunnel that is already open (or closed for good) returns success
    /// without side effects.
    ///
    /// Returns a boxed future (rather than `async fn`) because this method
    /// re-enters itself indirectly via the reconnect task spawned below;
    /// without boxing, the compiler cannot resolve the resulting recursive
    /// `impl Future` type when checking it for `Send`.
    pub fn open(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(self.open_impl())
    }

    async fn open_impl(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.stopped || inner.child_pid.is_some() {
            return Ok(());
        }

        let remote = RemoteEndpoint::parse(&self.config.forwards_to)?;

        let socket_dir = TempDir::with_prefix("servegate_tun.")
            .context("creating tunnel socket dir")?;
        let socket_path = socket_dir.path().join("socket");

        info!(
            alt_host = %self.alt_host,
            ssh = %self.config.host,
            remote = %remote.authority(),
            "Opening SSH tunnel"
        );

        let mut child = Command::new("ssh")
            .arg("-N")
            .arg("-o")
            .arg("ServerAliveInterval=60")
            .arg("-o")
            .arg("ServerAliveCountMax=3")
            .arg("-L")
            .arg(format!(
                "{}:{}:{}",
                socket_path.display(),
                remote.host,
                remote.port
            ))
            .arg(&self.config.host)
            .stdin(Stdio::null())
            .spawn()
            .context("failed to start SSH tunnel")?;

        if let Err(e) = wait_for_socket(&socket_path).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e.context("SSH tunnel failed to create socket"));
        }

        let tls = remote.https.then(|| tls_connector(self.config.insecure_skip_verify_tls));

        inner.child_pid = child.id();
        inner.socket_dir = Some(socket_dir);
        inner.forwarder = Some(Forwarder {
            socket_path,
            remote,
            tls,
        });
        drop(inner);

        // The supervisor owns the child from here: reap it, then reconnect
        // after a short pause unless the tunnel was closed meanwhile.
        let tunnel = Arc::clone(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            info!(alt_host = %tunnel.alt_host, ?status, "SSH tunnel exited");

            let reconnect = {
                let mut inner = tunnel.inner.lock().await;
                inner.child_pid = None;
                !inner.stopped && tunnel.config.should_reconnect()
            };
            if !reconnect {
                return;
            }

            tokio::time::sleep(RECONNECT_PAUSE).await;
            info!(alt_host = %tunnel.alt_host, "Reconnecting SSH tunnel");
            if let Err(e) = tunnel.open().await {
                warn!(alt_host = %tunnel.alt_host, error = %e, "Failed to reconnect SSH tunnel");
            }
        });

        Ok(())
    }

    /// Kill the ssh child and delete the socket directory. Safe to call
    /// repeatedly; wins over any pending reconnect.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.stopped = true;
        if let Some(pid) = inner.child_pid.take() {
            kill_pid(pid);
        }
        // Dropping the TempDir removes the socket directory.
        inner.socket_dir = None;
    }

    /// Relay one request over the tunnel socket.
    ///
    /// 503 before the first successful `open`; 502 when the socket cannot be
    /// dialed or the remote end fails.
    pub async fn forward(&self, req: Request<Incoming>) -> Result<Response<GateBody>, GateError> {
        let forwarder = {
            let inner = self.inner.lock().await;
            inner.forwarder.clone()
        };
        let Some(forwarder) = forwarder else {
            return Err(GateError::TunnelNotOpen);
        };

        match relay(&forwarder, req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(alt_host = %self.alt_host, error = %e, "Tunnel relay failed");
                Err(GateError::TunnelBroken)
            }
        }
    }
}

async fn wait_for_socket(path: &std::path::Path) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + SOCKET_WAIT_DEADLINE;
    while tokio::time::Instant::now() < deadline {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::time::sleep(SOCKET_WAIT_INTERVAL).await;
    }
    anyhow::bail!("timeout waiting for socket {}", path.display())
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {}

/// Dial the Unix socket, optionally wrap in TLS, and run one HTTP/1 exchange.
async fn relay(
    forwarder: &Forwarder,
    req: Request<Incoming>,
) -> anyhow::Result<Response<GateBody>> {
    let stream = UnixStream::connect(&forwarder.socket_path)
        .await
        .context("dialing tunnel socket")?;

    let req = rewrite_request(req, &forwarder.remote)?;

    let response = if let Some(tls) = &forwarder.tls {
        let name = ServerName::try_from(forwarder.remote.host.clone())
            .context("invalid TLS server name")?;
        let stream = tls
            .connect(name, stream)
            .await
            .context("TLS handshake over tunnel")?;
        http1_exchange(TokioIo::new(stream), req).await?
    } else {
        http1_exchange(TokioIo::new(stream), req).await?
    };

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Point the request at the remote endpoint: origin-form URI, Host header of
/// the remote authority.
fn rewrite_request(
    req: Request<Incoming>,
    remote: &RemoteEndpoint,
) -> anyhow::Result<Request<Incoming>> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path_and_query
        .parse()
        .context("rebuilding tunnel request URI")?;

    parts.headers.insert(
        hyper::header::HOST,
        hyper::header::HeaderValue::from_str(&remote.authority())
            .context("remote authority is not a valid Host header")?,
    );

    Ok(Request::from_parts(parts, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel_config(forwards_to: &str) -> SshTunnelConfig {
        SshTunnelConfig {
            host: "user@bastion".to_string(),
            forwards_to: forwards_to.to_string(),
            reconnect: Some(false),
            insecure_skip_verify_tls: false,
        }
    }

    #[test]
    fn test_remote_endpoint_parsing() {
        let remote = RemoteEndpoint::parse("10.0.0.2:8080").unwrap();
        assert_eq!(remote.host, "10.0.0.2");
        assert_eq!(remote.port, 8080);
        assert!(!remote.https);

        let remote = RemoteEndpoint::parse("https://internal.example").unwrap();
        assert_eq!(remote.port, 443);
        assert!(remote.https);

        let remote = RemoteEndpoint::parse("http://internal.example").unwrap();
        assert_eq!(remote.port, 80);
        assert!(!remote.https);

        assert!(RemoteEndpoint::parse("http://").is_err());
    }

    #[tokio::test]
    async fn test_initial_state_has_no_forwarder() {
        let tunnel = SshTunnel::new("alt.example.com", tunnel_config("10.0.0.2:8080"));
        let inner = tunnel.inner.lock().await;
        assert!(inner.forwarder.is_none());
        assert!(!inner.stopped);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sets_stopped() {
        let tunnel = SshTunnel::new("alt.example.com", tunnel_config("10.0.0.2:8080"));
        tunnel.close().await;
        tunnel.close().await;

        let inner = tunnel.inner.lock().await;
        assert!(inner.stopped);
        assert!(inner.child_pid.is_none());
    }

    #[tokio::test]
    async fn test_open_after_close_is_a_no_op() {
        let tunnel = SshTunnel::new("alt.example.com", tunnel_config("10.0.0.2:8080"));
        tunnel.close().await;

        tunnel.open().await.unwrap();
        let inner = tunnel.inner.lock().await;
        assert!(inner.child_pid.is_none());
        assert!(inner.forwarder.is_none());
    }
}
