//! Servegate - a host-name-aware reverse proxy with on-demand backends
//!
//! This library provides a gateway that:
//! - Routes HTTP/HTTPS traffic by Host header: a subdomain of the configured
//!   parent domain selects a service
//! - Spawns a service's backend process on the first request and probes it
//!   until it accepts traffic
//! - Stops idle backends after a per-service timeout, gracefully when a
//!   kill_timeout grants a SIGINT window
//! - Publishes start/stop events on an in-process bus, exposed to clients as
//!   an SSE stream on the management API
//! - Forwards alt-host traffic through supervised SSH tunnels over local
//!   Unix-domain sockets, reconnecting when the tunnel drops
//! - Serves static file trees and filters clients by IP allow/block lists

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod files;
pub mod ipfilter;
pub mod proxy;
pub mod router;
pub mod server;
pub mod service;
pub mod tunnel;
