//! Health monitor run next to each endpoint
//!
//! Probes the peer endpoint in bursts and terminates the local unit once the
//! peer has been unreachable for a number of consecutive cycles. Anything
//! short of that threshold is retried silently.

use crate::clock::SharedClock;
use crate::config::{BackoffKind, MonitorConfig, TerminateTarget};
use crate::name::Role;
use crate::poll::{poll_until, PollPolicy};
use crate::provider::{Prober, SharedProber, ENV_BACKEND_ADDRESS, ENV_WORKLOAD};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Inter-cycle delay policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// `interval * 2^(failures-1)`, capped at `max`
    Exponential { max: Duration },
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub grace: Duration,
    pub interval: Duration,
    pub attempts: u32,
    pub attempt_spacing: Duration,
    pub attempt_timeout: Duration,
    pub failure_threshold: u32,
    pub backoff: Backoff,
}

impl MonitorSettings {
    /// Settings for the monitor running next to an endpoint of `role`
    pub fn for_role(config: &MonitorConfig, role: Role) -> Self {
        let backoff = match config.backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential {
                max: config.max_backoff(),
            },
        };
        Self {
            grace: config.grace(role),
            interval: config.interval(),
            attempts: config.attempts.max(1),
            attempt_spacing: config.attempt_spacing(),
            attempt_timeout: config.attempt_timeout(),
            failure_threshold: config.failure_threshold.max(1),
            backoff,
        }
    }

    /// Delay before the next cycle given the current failure count
    pub fn delay_after(&self, consecutive_failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max } => {
                if consecutive_failures == 0 {
                    return self.interval;
                }
                let factor = 1u32.checked_shl(consecutive_failures - 1).unwrap_or(u32::MAX);
                self.interval.saturating_mul(factor).min(max)
            }
        }
    }
}

/// In-memory probe state. A restarted monitor starts healthy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeState {
    pub consecutive_failures: u32,
    pub shutting_down: bool,
}

impl ProbeState {
    /// Returns true if the peer was failing before
    pub fn record_success(&mut self) -> bool {
        let recovered = self.consecutive_failures > 0;
        self.consecutive_failures = 0;
        recovered
    }

    /// Returns true once the threshold is reached
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= threshold {
            self.shutting_down = true;
        }
        self.shutting_down
    }
}

/// Why the monitor loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Graceful shutdown requested from outside
    Shutdown,
    /// The peer was lost and the local unit was told to terminate
    Terminated { failures: u32 },
}

/// Stops the local unit
pub trait Terminator: Send + Sync {
    fn terminate(&self) -> anyhow::Result<()>;
}

/// Sends SIGTERM to the monitor's process group or to its parent
pub struct SignalTerminator {
    target: TerminateTarget,
}

impl SignalTerminator {
    pub fn new(target: TerminateTarget) -> Self {
        Self { target }
    }
}

impl Terminator for SignalTerminator {
    #[cfg(unix)]
    fn terminate(&self) -> anyhow::Result<()> {
        // kill(0, ..) addresses every process in our group
        let pid = match self.target {
            TerminateTarget::ProcessGroup => 0,
            TerminateTarget::Parent => unsafe { libc::getppid() },
        };
        info!(target = ?self.target, pid, "Sending SIGTERM");
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            anyhow::bail!("kill failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> anyhow::Result<()> {
        warn!(target = ?self.target, "Signals unsupported on this platform, exiting only");
        Ok(())
    }
}

/// HTTP prober: 2xx and 3xx count as alive, redirects are not followed
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => {
                let status = response.status();
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                debug!(url, error = %e, "Probe failed");
                false
            }
        }
    }
}

pub struct HealthMonitor {
    role: Role,
    peer_url: String,
    prober: SharedProber,
    terminator: Arc<dyn Terminator>,
    clock: SharedClock,
    settings: MonitorSettings,
}

impl HealthMonitor {
    pub fn new(
        role: Role,
        peer_url: String,
        prober: SharedProber,
        terminator: Arc<dyn Terminator>,
        clock: SharedClock,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            role,
            peer_url,
            prober,
            terminator,
            clock,
            settings,
        }
    }

    /// Run until shutdown or until the peer is declared lost
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> MonitorExit {
        let mut state = ProbeState::default();
        info!(
            role = %self.role,
            peer = %self.peer_url,
            grace_secs = self.settings.grace.as_secs(),
            threshold = self.settings.failure_threshold,
            "Health monitor started"
        );

        if !self.pause(self.settings.grace, &mut shutdown_rx).await {
            info!(role = %self.role, "Health monitor shutting down during grace period");
            return MonitorExit::Shutdown;
        }

        while !state.shutting_down {
            if self.probe_peer().await {
                if state.record_success() {
                    info!(role = %self.role, peer = %self.peer_url, "Peer recovered");
                }
            } else if state.record_failure(self.settings.failure_threshold) {
                error!(
                    role = %self.role,
                    peer = %self.peer_url,
                    failures = state.consecutive_failures,
                    "Peer lost, terminating"
                );
                if let Err(e) = self.terminator.terminate() {
                    error!(error = %e, "Failed to signal termination");
                }
                return MonitorExit::Terminated {
                    failures: state.consecutive_failures,
                };
            } else {
                warn!(
                    role = %self.role,
                    peer = %self.peer_url,
                    failures = state.consecutive_failures,
                    threshold = self.settings.failure_threshold,
                    "Peer unreachable"
                );
            }

            let delay = self.settings.delay_after(state.consecutive_failures);
            if !self.pause(delay, &mut shutdown_rx).await {
                info!(role = %self.role, "Health monitor shutting down");
                return MonitorExit::Shutdown;
            }
        }

        MonitorExit::Shutdown
    }

    /// One burst of attempts; true if any attempt succeeded
    async fn probe_peer(&self) -> bool {
        let policy = PollPolicy::attempts(self.settings.attempts, self.settings.attempt_spacing);
        poll_until(self.clock.as_ref(), policy, "peer health", || async {
            Ok::<_, anyhow::Error>(
                self.prober
                    .probe(&self.peer_url, self.settings.attempt_timeout)
                    .await
                    .then_some(()),
            )
        })
        .await
        .is_ok()
    }

    /// Sleep unless shutdown is requested first. Returns false on shutdown.
    async fn pause(&self, duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        if *shutdown_rx.borrow() {
            return false;
        }
        tokio::select! {
            _ = self.clock.sleep(duration) => true,
            _ = shutdown_requested(shutdown_rx) => false,
        }
    }
}

async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            // Sender gone: nobody can ask us to stop any more
            std::future::pending::<()>().await;
        }
    }
}

/// Peer URL from an address and the configured port and health path
pub fn peer_url(address: &str, config: &MonitorConfig) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        return address.to_string();
    }
    let host = if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:{}", address, config.peer_port)
    };
    format!("http://{}{}", host, config.health_path)
}

/// Peer address handed to a unit at creation. A frontend is told its
/// backend's address; a backend reaches its frontend by the
/// `frontend.<workload>` host name every provisioner gives the frontend.
pub fn peer_address_from_env<F>(role: Role, var: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    match role {
        Role::Frontend => var(ENV_BACKEND_ADDRESS),
        Role::Backend => var(ENV_WORKLOAD).map(|workload| Role::Frontend.endpoint_host(&workload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(backoff: Backoff) -> MonitorSettings {
        MonitorSettings {
            grace: Duration::from_secs(60),
            interval: Duration::from_secs(5),
            attempts: 5,
            attempt_spacing: Duration::from_secs(1),
            attempt_timeout: Duration::from_millis(2500),
            failure_threshold: 5,
            backoff,
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let s = settings(Backoff::Fixed);
        assert_eq!(s.delay_after(0), Duration::from_secs(5));
        assert_eq!(s.delay_after(4), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let s = settings(Backoff::Exponential {
            max: Duration::from_secs(30),
        });
        assert_eq!(s.delay_after(0), Duration::from_secs(5));
        assert_eq!(s.delay_after(1), Duration::from_secs(5));
        assert_eq!(s.delay_after(2), Duration::from_secs(10));
        assert_eq!(s.delay_after(3), Duration::from_secs(20));
        assert_eq!(s.delay_after(4), Duration::from_secs(30));
        assert_eq!(s.delay_after(40), Duration::from_secs(30));
    }

    #[test]
    fn test_probe_state_threshold() {
        let mut state = ProbeState::default();
        for _ in 0..4 {
            assert!(!state.record_failure(5));
        }
        assert!(state.record_success());
        assert_eq!(state.consecutive_failures, 0);
        for _ in 0..4 {
            assert!(!state.record_failure(5));
        }
        assert!(state.record_failure(5));
        assert!(state.shutting_down);
    }

    #[test]
    fn test_settings_from_config() {
        let config = MonitorConfig::default();
        let frontend = MonitorSettings::for_role(&config, Role::Frontend);
        let backend = MonitorSettings::for_role(&config, Role::Backend);
        assert_eq!(frontend.grace, Duration::from_secs(600));
        assert_eq!(backend.grace, Duration::from_secs(60));
        assert_eq!(backend.backoff, Backoff::Fixed);
    }

    #[test]
    fn test_peer_url() {
        let config = MonitorConfig::default();
        assert_eq!(peer_url("10.0.1.5", &config), "http://10.0.1.5:8080/health");
        assert_eq!(peer_url("10.0.1.5:9000", &config), "http://10.0.1.5:9000/health");
        assert_eq!(peer_url("https://demo.example.com/", &config), "https://demo.example.com/");
    }

    #[test]
    fn test_peer_address_from_env() {
        let env = |key: &str| match key {
            "WAKEGATE_BACKEND_ADDRESS" => Some("10.0.1.5".to_string()),
            "WAKEGATE_WORKLOAD" => Some("demo".to_string()),
            _ => None,
        };
        assert_eq!(peer_address_from_env(Role::Frontend, env).unwrap(), "10.0.1.5");
        assert_eq!(peer_address_from_env(Role::Backend, env).unwrap(), "frontend.demo");
        assert!(peer_address_from_env(Role::Frontend, |_: &str| None).is_none());
    }
}
