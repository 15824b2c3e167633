// ── Runtime client configuration ──
//
// Describes *how* to reach a DPM service and how to size the session pool
// and subscription buffers. Carries credential providers but never touches
// disk; `dpmlink-config` builds one of these from profiles.

use std::sync::Arc;
use std::time::Duration;

use dpmlink_api::{Connect, CredentialProvider, DEFAULT_PORT, TcpConnector};

pub const DEFAULT_HOST: &str = "acsys-proxy.fnal.gov";

/// Configuration for one client and its session pool.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Default deadline for read and write calls.
    pub timeout: Duration,
    /// Bound on establishing a single TCP connection.
    pub connect_timeout: Duration,
    /// Idle sessions retained for reads and subscriptions.
    pub plain_idle_capacity: usize,
    /// Idle settings-enabled sessions retained for writes.
    pub write_idle_capacity: usize,
    /// Hard cap on pooled sessions open at once (idle or checked out).
    pub max_open: usize,
    /// Readings buffered per subscription before new arrivals are dropped.
    pub buffer_capacity: usize,
    /// Longest a subscription dispatch loop waits on the socket before
    /// re-checking for cancellation.
    pub poll_interval: Duration,
    /// Minimum spacing between buffer-overflow warnings.
    pub drop_warning_interval: Duration,
    /// Role attached to writes that do not name one.
    pub role: Option<String>,
    /// Credentials for the settings handshake. Writes fail without them.
    pub credentials: Option<Arc<dyn CredentialProvider>>,
    /// Replaces the TCP connector, e.g. with an in-memory service.
    pub connector: Option<Arc<dyn Connect>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            plain_idle_capacity: 4,
            write_idle_capacity: 4,
            max_open: 256,
            buffer_capacity: 10_000,
            poll_interval: Duration::from_millis(250),
            drop_warning_interval: Duration::from_secs(5),
            role: None,
            credentials: None,
            connector: None,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connect>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// The connector new sessions are opened through.
    pub(crate) fn connector(&self) -> Arc<dyn Connect> {
        match &self.connector {
            Some(c) => Arc::clone(c),
            None => Arc::new(TcpConnector::new(
                self.host.clone(),
                self.port,
                self.connect_timeout,
            )),
        }
    }
}
