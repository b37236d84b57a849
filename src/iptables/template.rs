use crate::iptables::ports::{self, PortSpec, Proto, MULTIPORT_BUDGET};
use crate::settings::PortWhitelist;

pub const TCP_PORTS: &str = "{{TCP_PORTS}}";
pub const UDP_PORTS: &str = "{{UDP_PORTS}}";

/// Lines mentioning this are UDP handling; dropped when anti-pollution is off.
pub const UDP_MARKER: &str = "udp";

/// Fake-IP range answered by the poisoned-DNS countermeasure. Rules excluding
/// it would bypass the countermeasure, so they are dropped while it is active.
pub const POISON_EXCLUSION_SUBNET: &str = "240.0.0.0/4";

/// Policy inputs for one preprocessing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleOptions {
    /// Port the proxy itself listens on; always whitelisted for TCP.
    pub self_port: u16,
    pub anti_pollution: bool,
    pub drop_spoofing: bool,
}

/// Turn a raw rule template into concrete rule text.
///
/// `whitelist` is not modified; the self port is added to a private copy.
pub fn preprocess(template: &str, whitelist: &PortWhitelist, opts: &RuleOptions) -> String {
    let mut wl = whitelist.clone();
    let self_port = PortSpec::Single(opts.self_port);
    if !wl.has(&self_port, Proto::Tcp) {
        wl.tcp.push(self_port);
    }

    let mut lines: Vec<String> = Vec::new();
    for line in template.lines() {
        if line.contains(TCP_PORTS) {
            expand(line, TCP_PORTS, &wl.tcp, &mut lines);
        } else if line.contains(UDP_PORTS) {
            expand(line, UDP_PORTS, &wl.udp, &mut lines);
        } else {
            lines.push(line.to_string());
        }
    }

    if !opts.anti_pollution {
        lines.retain(|l| !l.contains(UDP_MARKER));
    }
    if opts.drop_spoofing {
        lines.retain(|l| !l.contains(POISON_EXCLUSION_SUBNET));
    }
    lines.join("\n")
}

/// One output line per port group; no groups means no line at all.
fn expand(line: &str, placeholder: &str, specs: &[PortSpec], out: &mut Vec<String>) {
    for group in ports::groups(specs, MULTIPORT_BUDGET) {
        out.push(line.replacen(placeholder, &ports::join_csv(group), 1));
    }
}
