use crate::config::NetworkConfig;

/// Station connection plus the credential store behind it.
pub trait NetworkProvisioner {
    type Error;

    fn connect(&mut self) -> Result<(), Self::Error>;
    fn reset_credentials(&mut self) -> Result<(), Self::Error>;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalDecision {
    Wait,
    Restart,
}

/// Tracks the configuration portal deadline: once credentials are saved or the timeout
/// passes, the device restarts.
#[derive(Debug, Clone)]
pub struct PortalTimer {
    started_ms: u64,
    timeout_ms: u64,
}

impl PortalTimer {
    pub fn new(started_ms: u64, timeout_s: u64) -> Self {
        Self {
            started_ms,
            timeout_ms: timeout_s.saturating_mul(1_000),
        }
    }

    pub fn poll(&self, now_ms: u64, network: &NetworkConfig) -> PortalDecision {
        if network.has_credentials()
            || crate::clock::elapsed_ms(now_ms, self.started_ms) >= self.timeout_ms
        {
            PortalDecision::Restart
        } else {
            PortalDecision::Wait
        }
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.timeout_ms
            .saturating_sub(crate::clock::elapsed_ms(now_ms, self.started_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_waits_until_timeout() {
        let timer = PortalTimer::new(1_000, 180);
        let network = NetworkConfig::default();
        assert_eq!(timer.poll(100_000, &network), PortalDecision::Wait);
        assert_eq!(timer.remaining_ms(100_000), 81_000);
        assert_eq!(timer.poll(181_000, &network), PortalDecision::Restart);
    }

    #[test]
    fn saved_credentials_restart_immediately() {
        let timer = PortalTimer::new(0, 180);
        let network = NetworkConfig {
            wifi_ssid: "home".to_string(),
            wifi_pass: "hunter2".to_string(),
        };
        assert_eq!(timer.poll(5, &network), PortalDecision::Restart);
    }
}
