use std::time::Duration;

use crate::shell;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// What the host kernel's packet filter can do for us.
///
/// Owned by one orchestrator; a failed TPROXY setup downgrades it for the
/// rest of that orchestrator's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCaps {
    tproxy: bool,
}

impl HostCaps {
    pub fn new(tproxy: bool) -> Self {
        Self { tproxy }
    }

    /// Best-effort probe: `iptables -j TPROXY -h` only succeeds when the
    /// xt_TPROXY target can be loaded.
    pub fn probe() -> Self {
        let tproxy = shell::run_timeout("iptables", &["-j", "TPROXY", "-h"], false, PROBE_TIMEOUT)
            .map(|(c, _)| c == 0)
            .unwrap_or(false);
        log::info!("iptables TPROXY support: {tproxy}");
        Self { tproxy }
    }

    pub fn tproxy(&self) -> bool {
        self.tproxy
    }

    pub fn downgrade_tproxy(&mut self) {
        if self.tproxy {
            log::warn!("TPROXY disabled for this process; falling back to REDIRECT from now on");
        }
        self.tproxy = false;
    }
}
