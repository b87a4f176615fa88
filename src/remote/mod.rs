//! Remote execution: daemon wire protocol, SSH bootstrap, connection pool.
//!
//! The daemon is a small authenticated HTTP server ([`daemon`]) launched on
//! a remote host by the SSH bootstrap ([`bootstrap`]). The local side talks
//! to it through a typed client ([`client`]) and manages one keep-alive
//! entry per host in a process-wide pool ([`pool`]). Request/response
//! shapes and the startup marker live in [`protocol`] and are shared by
//! both sides, so the wire stays bit-exact by construction.

pub mod bootstrap;
pub mod client;
pub mod daemon;
pub mod pool;
pub mod protocol;

pub use bootstrap::{AuthMethod, BootstrapOptions, Bootstrapper, RemoteHost, SshBootstrapper};
pub use client::DaemonClient;
pub use daemon::{Daemon, DaemonSettings};
pub use pool::{ConnectionInfo, ConnectionPool, ConnectionStatus};
pub use protocol::{DaemonInfo, ExecRequest, ExecResponse, HealthResponse};
