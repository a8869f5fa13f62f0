//! Health probes
//!
//! Independent, non-throwing checks over the pieces the supervisor depends
//! on: the persisted configuration, the two intra-app services, port and
//! disk availability at startup. Probes never propagate an error past their
//! own boundary; an internal fault degrades to `healthy=true` with warning
//! severity so a broken probe cannot cascade a false failure into recovery.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::SupervisorResult;
use crate::traits::ServiceTopology;
use shared::{ProbeResult, ProbeSeverity, ServiceCheck, ServiceStatus};

/// Ceiling for any single reachability attempt
const SERVICE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProbeSet {
    topology: Arc<dyn ServiceTopology>,
    config_path: PathBuf,
    data_dir: PathBuf,
    client: reqwest::Client,
}

impl ProbeSet {
    pub fn new(topology: Arc<dyn ServiceTopology>, config_path: PathBuf, data_dir: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SERVICE_PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            topology,
            config_path,
            data_dir,
            client,
        }
    }

    /// Validate the persisted configuration file
    ///
    /// Missing file is expected on first run (info); unparseable JSON or a
    /// missing schema-critical field is critical; a valid file with no
    /// credential for the active source is a warning.
    pub async fn config_probe(&self) -> ProbeResult {
        const NAME: &str = "config";

        let content = match tokio::fs::read_to_string(&self.config_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ProbeResult::passing(NAME, "config not yet created (expected on first run)");
            }
            Err(e) => return ProbeResult::degraded_default(NAME, e),
        };

        let value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                return ProbeResult::failing(NAME, ProbeSeverity::Critical, format!("config is not valid JSON: {e}"));
            }
        };

        let Some(active_source) = value.get("primaryApi").and_then(|v| v.as_str()) else {
            return ProbeResult::failing(NAME, ProbeSeverity::Critical, "config is missing required field 'primaryApi'");
        };

        let credential_key = format!("{active_source}ApiKey");
        let has_credential = value
            .get(&credential_key)
            .and_then(|v| v.as_str())
            .is_some_and(|v| !v.is_empty());

        if has_credential {
            ProbeResult::passing(NAME, format!("config valid, credentials present for '{active_source}'"))
        } else {
            ProbeResult::warning(NAME, format!("config valid but no credentials configured for '{active_source}'"))
        }
    }

    /// Protocol router reachability over plain TCP
    pub async fn router_probe(&self) -> ProbeResult {
        check_to_probe(self.router_check().await)
    }

    /// Embedded HTTP server reachability; any HTTP response counts
    pub async fn http_server_probe(&self) -> ProbeResult {
        check_to_probe(self.http_server_check().await)
    }

    /// Structured router check, consumed by the runtime checker's snapshots
    pub async fn router_check(&self) -> ServiceCheck {
        let status = self.topology.router_status().await;
        if !status.running {
            return stopped_check("router", status);
        }

        let started = Instant::now();
        let connect = TcpStream::connect((Ipv4Addr::LOCALHOST, status.port));
        match tokio::time::timeout(SERVICE_PROBE_TIMEOUT, connect).await {
            Ok(Ok(_stream)) => reachable_check("router", status, started.elapsed()),
            Ok(Err(e)) => {
                debug!("router connect to port {} failed: {e}", status.port);
                unreachable_check("router", status)
            }
            Err(_) => unreachable_check("router", status),
        }
    }

    /// Structured HTTP server check; any HTTP response counts as reachable
    pub async fn http_server_check(&self) -> ServiceCheck {
        let status = self.topology.http_server_status().await;
        if !status.running {
            return stopped_check("http-server", status);
        }

        let url = format!("http://127.0.0.1:{}/", status.port);
        let started = Instant::now();
        match self.client.get(&url).send().await {
            Ok(response) => {
                let latency = started.elapsed();
                debug!("http server answered {} in {}ms", response.status(), latency.as_millis());
                reachable_check("http-server", status, latency)
            }
            Err(e) => {
                debug!("http server request to port {} failed: {e}", status.port);
                unreachable_check("http-server", status)
            }
        }
    }

    /// Probes run once at startup: config, disk, and port availability for
    /// any service that has not started yet
    pub async fn startup_probes(&self) -> Vec<ProbeResult> {
        let mut results = vec![self.config_probe().await, self.disk_probe().await];

        let router = self.topology.router_status().await;
        if !router.running {
            results.push(self.port_probe("router-port", router.port).await);
        }
        let server = self.topology.http_server_status().await;
        if !server.running {
            results.push(self.port_probe("http-server-port", server.port).await);
        }
        results
    }

    /// Startup check: can the given service port still be bound
    pub async fn port_probe(&self, name: &str, port: u16) -> ProbeResult {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => {
                drop(listener);
                ProbeResult::passing(name, format!("port {port} available"))
            }
            Err(e) => ProbeResult::failing(name, ProbeSeverity::Warning, format!("port {port} not available: {e}")),
        }
    }

    /// Startup check: the data directory must accept writes, or the registry
    /// and instance marker cannot function
    pub async fn disk_probe(&self) -> ProbeResult {
        const NAME: &str = "disk";

        match self.try_write_probe_file().await {
            Ok(()) => ProbeResult::passing(NAME, "data directory writable"),
            Err(e) => ProbeResult::failing(NAME, ProbeSeverity::Critical, format!("data directory not writable: {e}")),
        }
    }

    async fn try_write_probe_file(&self) -> SupervisorResult<()> {
        let probe_path = self.data_dir.join(".disk-probe");
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::write(&probe_path, b"ok").await?;
        tokio::fs::remove_file(&probe_path).await?;
        Ok(())
    }
}

fn stopped_check(name: &str, status: ServiceStatus) -> ServiceCheck {
    ServiceCheck {
        name: name.to_string(),
        expected: false,
        reachable: false,
        port: status.port,
        latency_ms: None,
    }
}

fn reachable_check(name: &str, status: ServiceStatus, latency: Duration) -> ServiceCheck {
    ServiceCheck {
        name: name.to_string(),
        expected: true,
        reachable: true,
        port: status.port,
        latency_ms: Some(latency.as_millis() as u64),
    }
}

fn unreachable_check(name: &str, status: ServiceStatus) -> ServiceCheck {
    ServiceCheck {
        name: name.to_string(),
        expected: true,
        reachable: false,
        port: status.port,
        latency_ms: None,
    }
}

/// Lift a structured service check into the probe contract
fn check_to_probe(check: ServiceCheck) -> ProbeResult {
    let name = check.name.clone();
    if !check.expected {
        return ProbeResult::passing(&name, "service reported stopped; reachability not expected");
    }
    if check.reachable {
        let latency = check.latency_ms.unwrap_or(0);
        ProbeResult::passing(&name, format!("responsive on port {} ({}ms)", check.port, latency))
            .with_data(serde_json::json!({ "latency_ms": latency, "port": check.port }))
    } else {
        ProbeResult::failing(
            &name,
            ProbeSeverity::Critical,
            format!("service claims port {} but is unreachable", check.port),
        )
    }
}
