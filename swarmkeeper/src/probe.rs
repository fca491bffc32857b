//! Liveness probes against the node diagnostic endpoint.

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

use crate::retry::{RetryPolicy, poll_until};

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// `true` when the node answered healthy.
    async fn probe(&self, addr: IpAddr) -> bool;
}

/// HTTP GET against `http://<addr>:<port>/`; any 2xx counts as alive.
pub struct HttpProbe {
    client: reqwest::Client,
    port: u16,
}

impl HttpProbe {
    pub fn new(port: u16, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(HttpProbe { client, port })
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn probe(&self, addr: IpAddr) -> bool {
        let url = match addr {
            IpAddr::V4(ip) => format!("http://{}:{}/", ip, self.port),
            IpAddr::V6(ip) => format!("http://[{}]:{}/", ip, self.port),
        };
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!(addr=%addr, status=%response.status(), "Diagnostic endpoint unhealthy");
                false
            }
            Err(err) => {
                tracing::debug!(addr=%addr, error=%err, "Diagnostic endpoint unreachable");
                false
            }
        }
    }
}

/// Probe until the node answers or the budget runs out. `false` means every attempt failed.
pub async fn probe_with_budget(probe: &dyn LivenessProbe, addr: IpAddr, policy: RetryPolicy) -> bool {
    let what = format!("liveness of {}", addr);
    let result = poll_until(policy, &what, move || async move {
        Ok::<_, std::convert::Infallible>(probe.probe(addr).await.then_some(()))
    })
    .await;
    result.is_ok()
}
