//! Raw connectivity probe for the git host
//!
//! Two bounded steps: DNS resolution, then a TCP connect to the SSH port.
//! No retries here; retry policy belongs to the sync engine.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Outcome of a connectivity probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetState {
    /// Hostname did not resolve
    DnsFailure,
    /// Resolved, but no TCP connection within the timeout
    TcpUnreachable,
    Reachable,
}

/// Connectivity check seam; mocked in engine tests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, host: &str) -> NetState;
}

/// DNS + TCP probe against the configured SSH port
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    port: u16,
    step_timeout: Duration,
}

impl NetworkProbe {
    pub fn new(port: u16, step_timeout: Duration) -> Self {
        Self { port, step_timeout }
    }

    async fn resolve(&self, host: &str) -> Option<Vec<SocketAddr>> {
        let target = format!("{}:{}", host, self.port);

        match timeout(self.step_timeout, tokio::net::lookup_host(target)).await {
            Ok(Ok(addrs)) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    None
                } else {
                    Some(addrs)
                }
            }
            Ok(Err(e)) => {
                debug!("DNS resolution failed for {}: {}", host, e);
                None
            }
            Err(_) => {
                debug!("DNS resolution timed out for {}", host);
                None
            }
        }
    }
}

#[async_trait]
impl ConnectivityProbe for NetworkProbe {
    async fn probe(&self, host: &str) -> NetState {
        let addrs = match self.resolve(host).await {
            Some(addrs) => addrs,
            None => return NetState::DnsFailure,
        };

        for addr in addrs {
            match timeout(self.step_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => {
                    debug!("TCP connect to {} succeeded", addr);
                    return NetState::Reachable;
                }
                Ok(Err(e)) => debug!("TCP connect to {} failed: {}", addr, e),
                Err(_) => debug!("TCP connect to {} timed out", addr),
            }
        }

        NetState::TcpUnreachable
    }
}
