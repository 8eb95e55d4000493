//! Listener capability consumed by the controller.
//!
//! # Data Flow
//! ```text
//! ServerConf (committed by the controller)
//!     → ListenerFactory::build
//!     → Listener::start (bind, begin serving)
//!     → Listener::service_address (advertised by the publisher)
//!     → Listener::shutdown(grace) on restart or exit
//! ```
//!
//! # Design Decisions
//! - The controller only sees the traits; `http.rs` is the bundled implementation
//! - `start` returns once the socket is bound, so bind errors surface synchronously
//! - A listener is single-use: a restart builds a fresh one

pub mod handler;
pub mod http;

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::conf::ServerConf;

pub use handler::{Context, Handler, HandlerRegistry, Reply};
pub use http::{HttpListener, HttpListenerFactory};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("failed to load TLS material ({cert}, {key}): {source}")]
    Tls {
        cert: String,
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listener config: {0}")]
    Config(String),

    #[error("listener already started")]
    AlreadyStarted,
}

/// A running (or runnable) network listener.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Bind and begin serving. Returns once the socket is bound.
    async fn start(&mut self) -> Result<(), ListenerError>;

    /// Stop accepting, let in-flight requests finish within `grace`.
    async fn shutdown(&mut self, grace: Duration) -> Result<(), ListenerError>;

    /// Address as configured, e.g. `":9090"`.
    fn address(&self) -> &str;

    /// Reachable address advertised for discovery, e.g. `"http://10.0.0.4:9090"`.
    fn service_address(&self) -> String;
}

/// Builds listeners from parsed configuration.
pub trait ListenerFactory: Send + Sync {
    fn build(&self, conf: &ServerConf) -> Result<Box<dyn Listener>, ListenerError>;
}

/// Host peers should dial for a listener bound to `bound`.
///
/// A wildcard bind is resolved to the outbound interface address; the UDP
/// connect sends no packets.
pub fn advertised_host(bound: SocketAddr) -> IpAddr {
    if !bound.ip().is_unspecified() {
        return bound.ip();
    }
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
