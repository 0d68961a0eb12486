use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway.
///
/// Loaded once at startup and immutable afterwards. All request handlers hold
/// a shared reference; there is no hot reload.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener addresses
    #[serde(default)]
    pub listen: ListenConfig,

    /// Path to the TLS certificate chain (PEM)
    #[serde(default)]
    pub ssl_certificate: Option<String>,

    /// Path to the TLS private key (PEM)
    #[serde(default)]
    pub ssl_certificate_key: Option<String>,

    /// Parent domain; `<subdomain>.<domain>` routes to the matching service
    #[serde(default)]
    pub domain: String,

    /// Working directory entered at startup (default: the config file's dir)
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Client IPs / CIDRs permitted to connect (empty = everyone)
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Client IPs / CIDRs always rejected
    #[serde(default)]
    pub blocklist: Vec<String>,

    /// Services keyed by name
    #[serde(default)]
    pub services: HashMap<String, Service>,

    /// Alternative host names forwarded through SSH tunnels
    #[serde(default)]
    pub alt_hosts: HashMap<String, AltHost>,

    /// Subdomain -> service name index, derived at load time
    #[serde(skip)]
    pub services_by_subdomain: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ListenConfig {
    /// HTTP listen address ("host:port"), required
    #[serde(default)]
    pub http: String,

    /// HTTPS listen address; served only when the TLS files are also set
    #[serde(default)]
    pub https: String,
}

/// The closed set of backend kinds a service can resolve to.
///
/// Derived once from the config fields; `Unknown` never survives validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Unknown,
    Files,
    Proxy,
    Api,
}

/// A single logical backend addressable by subdomain.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Service {
    /// Subdomain label this service answers on; "" means the apex domain
    #[serde(default)]
    pub subdomain: String,

    /// Excluded from the management API's /list when true
    #[serde(default)]
    pub hidden: bool,

    /// Directory to serve as static files
    #[serde(default)]
    pub serve_files: String,

    /// Upstream URL or host:port this service proxies to
    #[serde(default)]
    pub forwards_to: String,

    /// Marks the management API service
    #[serde(default)]
    pub api: bool,

    /// Start this service at boot
    #[serde(default)]
    pub autostart: bool,

    /// Argv used to start the backend process; empty means nothing to spawn
    #[serde(default)]
    pub start: Vec<String>,

    /// Argv run instead of signalling when stopping the backend
    #[serde(default)]
    pub stop: Vec<String>,

    /// Seconds of inactivity before the backend is stopped; 0 disables
    #[serde(default)]
    pub timeout: u64,

    /// Seconds to wait after SIGINT before SIGKILL; 0 skips the graceful step
    #[serde(default)]
    pub kill_timeout: u64,
}

impl Service {
    /// Derive the service kind: first non-empty of serve_files, forwards_to, api.
    pub fn kind(&self) -> ServiceKind {
        if !self.serve_files.is_empty() {
            return ServiceKind::Files;
        }
        if !self.forwards_to.is_empty() {
            return ServiceKind::Proxy;
        }
        if self.api {
            return ServiceKind::Api;
        }
        ServiceKind::Unknown
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub fn kill_timeout(&self) -> Option<Duration> {
        (self.kill_timeout > 0).then(|| Duration::from_secs(self.kill_timeout))
    }

    /// Upstream target with the scheme defaulted to http.
    pub fn forward_target(&self) -> String {
        with_http_scheme(&self.forwards_to)
    }
}

/// A host name that forwards through a persistent tunnel instead of the
/// subdomain table.
#[derive(Debug, Deserialize, Clone)]
pub struct AltHost {
    pub ssh: SshTunnelConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SshTunnelConfig {
    /// SSH destination, e.g. "user@bastion"
    pub host: String,

    /// Remote endpoint the tunnel forwards to ("host:port" or URL)
    pub forwards_to: String,

    /// Re-open the tunnel when the ssh child exits (default true)
    #[serde(default)]
    pub reconnect: Option<bool>,

    /// Skip TLS certificate verification for an https remote
    #[serde(default)]
    pub insecure_skip_verify_tls: bool,
}

impl SshTunnelConfig {
    pub fn should_reconnect(&self) -> bool {
        self.reconnect.unwrap_or(true)
    }
}

/// Prefix `http://` unless the target already carries a scheme.
pub fn with_http_scheme(target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let config_dir = config_dir
            .canonicalize()
            .with_context(|| format!("resolving config dir of {}", path.display()))?;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;

        // Relative workdir is anchored at the config file's directory.
        config.workdir = Some(match config.workdir.take() {
            None => config_dir,
            Some(dir) if dir.is_relative() => config_dir.join(dir),
            Some(dir) => dir,
        });

        config.validate()?;

        config.services_by_subdomain = config
            .services
            .iter()
            .map(|(name, svc)| (svc.subdomain.clone(), name.clone()))
            .collect();

        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.listen.http.is_empty() {
            bail!("http listen address is required");
        }

        for (name, svc) in &self.services {
            if svc.kind() == ServiceKind::Unknown {
                bail!(
                    "service {}: one of serve_files, forwards_to, or api must be set",
                    name
                );
            }
        }

        for entry in self.allowlist.iter().chain(self.blocklist.iter()) {
            crate::ipfilter::parse_net(entry)
                .with_context(|| format!("invalid allowlist/blocklist entry {:?}", entry))?;
        }

        for (host, alt) in &self.alt_hosts {
            if alt.ssh.host.is_empty() {
                bail!("alt_host {}: ssh.host is required", host);
            }
            if alt.ssh.forwards_to.is_empty() {
                bail!("alt_host {}: ssh.forwards_to is required", host);
            }
        }

        Ok(())
    }

    /// Whether the HTTPS listener is fully configured.
    pub fn tls_enabled(&self) -> bool {
        !self.listen.https.is_empty()
            && self.ssl_certificate.is_some()
            && self.ssl_certificate_key.is_some()
    }

    /// Look up a service by its subdomain label.
    pub fn service_by_subdomain(&self, subdomain: &str) -> Option<(&str, &Service)> {
        let name = self.services_by_subdomain.get(subdomain)?;
        self.services.get(name).map(|svc| (name.as_str(), svc))
    }
}
