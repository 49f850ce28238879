//! Probe execution.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use super::{HealthCheckConfig, HealthError, HealthTarget, ProbeKind};
use crate::runtime::ContainerRuntime;

/// Address used when the pod has no address of its own (host networking).
const LOOPBACK: &str = "127.0.0.1";

/// A probe bound to its target.
pub enum Prober {
    Http {
        client: reqwest::Client,
        url: String,
    },
    Tcp {
        addr: String,
    },
    Command {
        runtime: Arc<dyn ContainerRuntime>,
        container_id: String,
        argv: Vec<String>,
    },
}

impl Prober {
    pub fn new(
        config: &HealthCheckConfig,
        target: HealthTarget,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, HealthError> {
        let host = || {
            let ip = target.ip.clone().unwrap_or_else(|| LOOPBACK.to_string());
            if ip.contains(':') {
                format!("[{ip}]")
            } else {
                ip
            }
        };

        Ok(match &config.probe {
            ProbeKind::Http { port, path, scheme } => {
                // 3xx counts as healthy, so redirects are not followed.
                let client = reqwest::Client::builder()
                    .redirect(reqwest::redirect::Policy::none())
                    .timeout(config.timeout)
                    .build()
                    .map_err(|e| HealthError::Client(e.to_string()))?;
                Prober::Http {
                    client,
                    url: format!("{scheme}://{}:{port}{path}", host()),
                }
            }
            ProbeKind::Tcp { port } => Prober::Tcp {
                addr: format!("{}:{port}", host()),
            },
            ProbeKind::Command { argv } => Prober::Command {
                runtime,
                container_id: target.container_id,
                argv: argv.clone(),
            },
        })
    }

    /// Runs one probe; anything that does not finish in `timeout` fails.
    pub async fn probe(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.probe_once()).await {
            Ok(ok) => ok,
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Health probe timed out");
                false
            }
        }
    }

    async fn probe_once(&self) -> bool {
        match self {
            Prober::Http { client, url } => match client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    (200..400).contains(&status)
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "HTTP probe failed");
                    false
                }
            },
            Prober::Tcp { addr } => match TcpStream::connect(addr.as_str()).await {
                Ok(_) => true,
                Err(e) => {
                    debug!(addr = %addr, error = %e, "TCP probe failed");
                    false
                }
            },
            Prober::Command {
                runtime,
                container_id,
                argv,
            } => match runtime.run_command(container_id, argv).await {
                Ok(output) => output.exit_code == 0,
                Err(e) => {
                    debug!(container_id = %container_id, error = %e, "Command probe failed");
                    false
                }
            },
        }
    }
}
