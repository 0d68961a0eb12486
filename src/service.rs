//! Per-service runtime state: the child process, the idle timer, and the
//! start/stop state machine.

use crate::config::{Config, Service, ServiceKind};
use crate::events::{Event, EventBus};
use anyhow::Context;
use dashmap::DashMap;
use hyper::Uri;
use parking_lot::Mutex as SyncMutex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Attempts the readiness probe makes before giving up.
const READY_PROBE_ATTEMPTS: u32 = 10;
/// Pause between readiness probe attempts.
const READY_PROBE_INTERVAL: Duration = Duration::from_secs(1);
/// Per-attempt connect/read timeout for the probe.
const READY_PROBE_IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Request-visible activity of one service.
struct Activity {
    last_used: Instant,
    idle_timer: Option<JoinHandle<()>>,
}

/// Runtime state of a single service.
///
/// Start, stop and the running check are serialized by one async mutex; the
/// readiness probe runs with that mutex held, so concurrent requests to a
/// starting service queue behind the first caller instead of racing a second
/// spawn. The activity cell has its own small lock so touching the idle timer
/// never waits on a transition in flight.
pub struct ServiceState {
    name: String,
    service: Service,
    events: Arc<EventBus>,
    child: Mutex<Option<Child>>,
    activity: SyncMutex<Activity>,
}

impl ServiceState {
    pub fn new(name: impl Into<String>, service: Service, events: Arc<EventBus>) -> Self {
        Self {
            name: name.into(),
            service,
            events,
            child: Mutex::new(None),
            activity: SyncMutex::new(Activity {
                last_used: Instant::now(),
                idle_timer: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn last_used(&self) -> Instant {
        self.activity.lock().last_used
    }

    /// Whether the service counts as running.
    ///
    /// Only the Proxy kind has a process to ask about; Files and API services
    /// are always considered running.
    pub async fn is_running(&self) -> bool {
        if self.service.kind() != ServiceKind::Proxy {
            return true;
        }
        let mut child = self.child.lock().await;
        child_alive(child.as_mut())
    }

    /// Ensure the backend process is up and has passed the readiness probe.
    ///
    /// Idempotent: a running child or an empty `start` argv is success without
    /// a spawn. On probe exhaustion the fresh child is torn down again and an
    /// error is returned, leaving the service stopped.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.child.lock().await;

        if child_alive(slot.as_mut()) {
            return Ok(());
        }

        let argv = &self.service.start;
        if argv.is_empty() {
            return Ok(());
        }

        info!(service = %self.name, command = ?argv, "Starting service");

        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("starting service {}", self.name))?;
        *slot = Some(child);

        if let Err(e) = self.wait_until_ready().await {
            // The spawn succeeded but the backend never answered; reap it so a
            // failed start leaves nothing behind.
            if let Some(mut child) = slot.take() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            return Err(e);
        }

        self.events.publish(Event::start(&self.name));
        Ok(())
    }

    /// Probe `forwards_to` until it accepts HTTP traffic, bounded by
    /// [`READY_PROBE_ATTEMPTS`] × [`READY_PROBE_INTERVAL`].
    async fn wait_until_ready(&self) -> anyhow::Result<()> {
        let target = self.service.forward_target();
        let uri: Uri = target
            .parse()
            .with_context(|| format!("parsing target URL {}", target))?;
        let host = uri.host().context("target URL has no host")?.to_string();
        let https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        let addr = format!("{}:{}", host, port);

        for attempt in 0..READY_PROBE_ATTEMPTS {
            if probe_once(&addr, &host, https).await {
                debug!(service = %self.name, attempt, "Service is ready");
                return Ok(());
            }
            tokio::time::sleep(READY_PROBE_INTERVAL).await;
        }

        anyhow::bail!("service did not start in time")
    }

    /// Stop the backend process and reap it.
    ///
    /// Precedence: a configured `stop` argv runs instead of any signal; else
    /// SIGINT with a `kill_timeout` grace window; else immediate SIGKILL.
    /// A no-op when no child is held.
    pub async fn stop(&self) {
        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            return;
        };

        info!(service = %self.name, "Stopping service");

        if !self.service.stop.is_empty() {
            let argv = &self.service.stop;
            match Command::new(&argv[0]).args(&argv[1..]).status().await {
                Ok(status) if !status.success() => {
                    warn!(service = %self.name, ?status, "Stop command exited non-zero");
                }
                Err(e) => {
                    warn!(service = %self.name, error = %e, "Stop command failed to run");
                }
                Ok(_) => {}
            }
            let _ = child.wait().await;
        } else if let Some(grace) = self.service.kill_timeout() {
            if send_interrupt(&child).is_err() {
                let _ = child.kill().await;
            } else {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        warn!(
                            service = %self.name,
                            grace_secs = grace.as_secs(),
                            "Shutdown grace period exceeded, killing process"
                        );
                        let _ = child.kill().await;
                    }
                }
            }
        } else {
            let _ = child.kill().await;
        }

        self.events.publish(Event::stop(&self.name));
    }

    /// Record request activity: advance `last_used` and re-arm the one-shot
    /// idle timer for Proxy services with a timeout configured.
    pub fn touch(self: &Arc<Self>) {
        let mut activity = self.activity.lock();
        activity.last_used = Instant::now();

        if let Some(timer) = activity.idle_timer.take() {
            timer.abort();
        }

        if self.service.kind() != ServiceKind::Proxy {
            return;
        }
        if let Some(idle) = self.service.idle_timeout() {
            let state = Arc::clone(self);
            activity.idle_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(idle).await;
                info!(service = %state.name, idle_secs = idle.as_secs(), "Idle timeout reached");
                state.stop().await;
            }));
        }
    }

    /// Drop any pending idle timer without firing it.
    pub fn cancel_idle_timer(&self) {
        if let Some(timer) = self.activity.lock().idle_timer.take() {
            timer.abort();
        }
    }
}

fn child_alive(child: Option<&mut Child>) -> bool {
    match child {
        Some(child) => matches!(child.try_wait(), Ok(None)),
        None => false,
    }
}

#[cfg(unix)]
fn send_interrupt(child: &Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Err(std::io::Error::other("process already reaped"));
    };
    let rc = unsafe { libc::kill(pid as i32, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_interrupt(_child: &Child) -> std::io::Result<()> {
    // No SIGINT off Unix; fall through to the kill path.
    Err(std::io::Error::other("interrupt not supported"))
}

/// One probe attempt. For a TLS upstream a successful TCP connect counts;
/// otherwise a plain HTTP GET must answer 2xx.
async fn probe_once(addr: &str, host: &str, https: bool) -> bool {
    let connect = tokio::time::timeout(READY_PROBE_IO_TIMEOUT, TcpStream::connect(addr)).await;
    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        _ => return false,
    };
    if https {
        return true;
    }

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        host
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read = tokio::time::timeout(READY_PROBE_IO_TIMEOUT, async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read {
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| (200..300).contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}

/// Registry of live [`ServiceState`]s keyed by service name.
///
/// States are created lazily on first use so a service that never sees
/// traffic never allocates runtime state.
pub struct ServiceMap {
    events: Arc<EventBus>,
    states: DashMap<String, Arc<ServiceState>>,
}

impl ServiceMap {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            events,
            states: DashMap::new(),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceState>> {
        self.states.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn get_or_create(&self, name: &str, service: &Service) -> Arc<ServiceState> {
        if let Some(state) = self.get(name) {
            return state;
        }
        let state = Arc::new(ServiceState::new(
            name,
            service.clone(),
            Arc::clone(&self.events),
        ));
        self.states
            .entry(name.to_string())
            .or_insert(state)
            .value()
            .clone()
    }

    /// Start every service marked `autostart`. Any failure is returned so
    /// boot can abort.
    pub async fn autostart(&self, config: &Config) -> anyhow::Result<()> {
        for (name, service) in &config.services {
            if !service.autostart {
                continue;
            }
            info!(service = %name, "Autostarting service");
            let state = self.get_or_create(name, service);
            state
                .start()
                .await
                .with_context(|| format!("autostarting service {}", name))?;
        }
        Ok(())
    }

    /// Stop every live service, cancelling idle timers first.
    pub async fn stop_all(&self) {
        let states: Vec<Arc<ServiceState>> =
            self.states.iter().map(|e| Arc::clone(e.value())).collect();
        for state in states {
            state.cancel_idle_timer();
            state.stop().await;
        }
    }
}
