//! Host-boundary service implementations
//!
//! Production wiring for the two injected seams the binary can provide on
//! its own: a static view of the intra-app service topology, and a terminal
//! consent prompt. The real desktop host replaces both with live
//! implementations at its own boundary.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::traits::{ConsentPrompt, ServiceTopology};
use shared::{RecoveryStrategy, ServiceStatus};

/// Fixed topology for hosts whose service ports are known at startup
pub struct StaticTopology {
    router: ServiceStatus,
    http_server: ServiceStatus,
}

impl StaticTopology {
    pub fn new(router_port: u16, http_server_port: u16) -> Self {
        Self {
            router: ServiceStatus {
                running: true,
                port: router_port,
            },
            http_server: ServiceStatus {
                running: true,
                port: http_server_port,
            },
        }
    }

    /// Mark the router as not expected to run (no tunnel configured)
    pub fn without_router(mut self) -> Self {
        self.router.running = false;
        self
    }
}

#[async_trait]
impl ServiceTopology for StaticTopology {
    async fn router_status(&self) -> ServiceStatus {
        self.router
    }

    async fn http_server_status(&self) -> ServiceStatus {
        self.http_server
    }
}

/// Terminal consent prompt: asks on stderr, reads one line from stdin
///
/// An unreadable or empty answer counts as declined; destructive recovery
/// never runs without an explicit "y".
pub struct StdinConsentPrompt;

#[async_trait]
impl ConsentPrompt for StdinConsentPrompt {
    async fn request_consent(&self, strategy: RecoveryStrategy, reason: &str) -> bool {
        eprintln!("Recovery {strategy} requested ({reason}). Proceed? [y/N]");

        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        match reader.read_line(&mut line).await {
            Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(e) => {
                warn!("consent prompt unreadable ({e}); treating as declined");
                false
            }
        }
    }
}
