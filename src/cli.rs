use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::iptables::Strategy;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "tpctl",
    about = "Transparent proxy interception control",
    long_about = "tpctl installs and removes the packet-filter rules that steer host traffic into a local proxy \
(TPROXY when the kernel supports it, REDIRECT otherwise) and optionally points the system resolver at the proxy.",
    after_help = r#"FILES
  /etc/tpctl/settings.json    interception mode, anti-pollution, listen address
  /etc/tpctl/whitelist.json   tcp/udp ports that are never intercepted
  /etc/resolv.conf.tpctlbak   present only while the resolver is hijacked

NOTES
  * enable/disable/status need root; preview does not.
  * The proxy must listen on port 32345 (tcp+udp) for intercepted traffic.
"#,
    arg_required_else_help = true
)]
pub struct Args {
    /// JSON config file; built-in defaults are used when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Install interception rules for the configured mode.
    Enable {
        /// Do nothing unless the proxy process is running.
        #[arg(long, default_value_t = false)]
        check_running: bool,
    },
    /// Remove all interception rules and restore the resolver.
    Disable,
    /// Print the preprocessed setup rules of a strategy without applying them.
    Preview {
        #[arg(value_parser = parse_strategy)]
        strategy: Strategy,
    },
    /// Show resolver hijack state, TPROXY support and whether the proxy runs.
    Status,
}

impl Command {
    pub fn needs_root(&self) -> bool {
        !matches!(self, Command::Preview { .. })
    }
}

fn parse_strategy(s: &str) -> Result<Strategy, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}
