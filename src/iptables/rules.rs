use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::{borrow::Cow, fmt, fs, io, path::PathBuf, str::FromStr, time::Duration};

use crate::shell;

/// TCP+UDP port the proxy's transparent inbound listens on.
pub const CONTROL_PORT: u16 = 32345;

const IPT_CMD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Tproxy,
    Redirect,
    DropSpoofing,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::Tproxy, Strategy::Redirect, Strategy::DropSpoofing];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Tproxy => "tproxy",
            Strategy::Redirect => "redirect",
            Strategy::DropSpoofing => "drop-spoofing",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tproxy" => Ok(Strategy::Tproxy),
            "redirect" => Ok(Strategy::Redirect),
            "drop-spoofing" | "drop_spoofing" => Ok(Strategy::DropSpoofing),
            other => bail!("unknown strategy: {other} (tproxy|redirect|drop-spoofing)"),
        }
    }
}

/// Applies and removes one strategy's packet-filter rules.
pub trait RuleService {
    /// Removes any previous rules of `strategy`, passes the raw setup
    /// template through `preprocess`, then applies the result.
    fn setup(&self, strategy: Strategy, preprocess: &dyn Fn(&str) -> String) -> Result<()>;

    /// Removes the rules of `strategy`. Missing rules are not an error.
    fn clean(&self, strategy: Strategy);
}

/// Runs a single rule command line.
pub trait Exec {
    fn exec(&self, line: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExec;

impl Exec for ShellExec {
    fn exec(&self, line: &str) -> Result<()> {
        shell::ok_sh_timeout(line, IPT_CMD_TIMEOUT).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    Clean,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Clean => "clean",
        }
    }
}

/// iptables rule sets, built in or overridden by
/// `<templates_dir>/<strategy>.<setup|clean>.rules`.
#[derive(Debug, Clone)]
pub struct IptablesRules<E: Exec = ShellExec> {
    exec: E,
    templates_dir: Option<PathBuf>,
}

impl IptablesRules<ShellExec> {
    pub fn new(templates_dir: Option<PathBuf>) -> Self {
        Self::with_exec(ShellExec, templates_dir)
    }
}

impl<E: Exec> IptablesRules<E> {
    pub fn with_exec(exec: E, templates_dir: Option<PathBuf>) -> Self {
        Self { exec, templates_dir }
    }

    /// Raw setup template of `strategy`, placeholders intact.
    pub fn setup_template(&self, strategy: Strategy) -> Result<Cow<'static, str>> {
        self.template(strategy, Phase::Setup)
    }

    fn template(&self, strategy: Strategy, phase: Phase) -> Result<Cow<'static, str>> {
        if let Some(dir) = &self.templates_dir {
            let path = dir.join(format!("{}.{}.rules", strategy, phase.as_str()));
            match fs::read_to_string(&path) {
                Ok(s) => {
                    debug!("using {} template {}", strategy, path.display());
                    return Ok(Cow::Owned(s));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("read template {}", path.display())),
            }
        }
        Ok(Cow::Borrowed(builtin(strategy, phase)))
    }
}

impl<E: Exec> RuleService for IptablesRules<E> {
    fn setup(&self, strategy: Strategy, preprocess: &dyn Fn(&str) -> String) -> Result<()> {
        self.clean(strategy);
        let raw = self.template(strategy, Phase::Setup)?;
        let commands = preprocess(&raw);
        for line in command_lines(&commands) {
            self.exec
                .exec(line)
                .with_context(|| format!("{strategy} setup"))?;
        }
        info!("{strategy} rules applied");
        Ok(())
    }

    fn clean(&self, strategy: Strategy) {
        let raw = match self.template(strategy, Phase::Clean) {
            Ok(t) => t,
            Err(e) => {
                warn!("{strategy} clean template unreadable, using built-in: {e:#}");
                Cow::Borrowed(builtin(strategy, Phase::Clean))
            }
        };
        for line in command_lines(&raw) {
            if let Err(e) = self.exec.exec(line) {
                debug!("{strategy} clean: {e:#}");
            }
        }
    }
}

fn command_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

fn builtin(strategy: Strategy, phase: Phase) -> &'static str {
    match (strategy, phase) {
        (Strategy::Tproxy, Phase::Setup) => TPROXY_SETUP,
        (Strategy::Tproxy, Phase::Clean) => TPROXY_CLEAN,
        (Strategy::Redirect, Phase::Setup) => REDIRECT_SETUP,
        (Strategy::Redirect, Phase::Clean) => REDIRECT_CLEAN,
        (Strategy::DropSpoofing, Phase::Setup) => DROP_SPOOFING_SETUP,
        (Strategy::DropSpoofing, Phase::Clean) => DROP_SPOOFING_CLEAN,
    }
}

// Mark 0x80 is set by the proxy on its own outbound sockets; 0x40 selects
// packets for TPROXY delivery through routing table 100.
const TPROXY_SETUP: &str = r#"
ip rule add fwmark 0x40/0xc0 table 100
ip route add local 0.0.0.0/0 dev lo table 100

iptables -w 2 -t mangle -N TP_OUT
iptables -w 2 -t mangle -N TP_PRE
iptables -w 2 -t mangle -N TP_RULE
iptables -w 2 -t mangle -N TP_MARK
iptables -w 2 -t mangle -I OUTPUT -j TP_OUT
iptables -w 2 -t mangle -I PREROUTING -j TP_PRE

iptables -w 2 -t mangle -A TP_OUT -m mark --mark 0x80/0x80 -j RETURN
iptables -w 2 -t mangle -A TP_OUT -p tcp -m multiport --sports {{TCP_PORTS}} -j RETURN
iptables -w 2 -t mangle -A TP_OUT -p udp -m multiport --sports {{UDP_PORTS}} -j RETURN
iptables -w 2 -t mangle -A TP_OUT -p tcp -m addrtype --src-type LOCAL ! --dst-type LOCAL -j TP_RULE
iptables -w 2 -t mangle -A TP_OUT -p udp -m addrtype --src-type LOCAL ! --dst-type LOCAL -j TP_RULE

iptables -w 2 -t mangle -A TP_PRE -i lo -m mark ! --mark 0x40/0xc0 -j RETURN
iptables -w 2 -t mangle -A TP_PRE -p tcp -m addrtype ! --src-type LOCAL ! --dst-type LOCAL -j TP_RULE
iptables -w 2 -t mangle -A TP_PRE -p udp -m addrtype ! --src-type LOCAL ! --dst-type LOCAL -j TP_RULE
iptables -w 2 -t mangle -A TP_PRE -p tcp -m mark --mark 0x40/0xc0 -j TPROXY --on-port 32345 --on-ip 127.0.0.1
iptables -w 2 -t mangle -A TP_PRE -p udp -m mark --mark 0x40/0xc0 -j TPROXY --on-port 32345 --on-ip 127.0.0.1

iptables -w 2 -t mangle -A TP_RULE -j CONNMARK --restore-mark
iptables -w 2 -t mangle -A TP_RULE -m mark --mark 0x40/0xc0 -j RETURN
iptables -w 2 -t mangle -A TP_RULE -i docker+ -j RETURN
iptables -w 2 -t mangle -A TP_RULE -i veth+ -j RETURN
iptables -w 2 -t mangle -A TP_RULE -d 0.0.0.0/32 -j RETURN
iptables -w 2 -t mangle -A TP_RULE -d 10.0.0.0/8 -j RETURN
iptables -w 2 -t mangle -A TP_RULE -d 100.64.0.0/10 -j RETURN
iptables -w 2 -t mangle -A TP_RULE -d 127.0.0.0/8 -j RETURN
iptables -w 2 -t mangle -A TP_RULE -d 169.254.0.0/16 -j RETURN
iptables -w 2 -t mangle -A TP_RULE -d 172.16.0.0/12 -j RETURN
iptables -w 2 -t mangle -A TP_RULE -d 192.168.0.0/16 -j RETURN
iptables -w 2 -t mangle -A TP_RULE -d 224.0.0.0/4 -j RETURN
iptables -w 2 -t mangle -A TP_RULE -d 240.0.0.0/4 -j RETURN
iptables -w 2 -t mangle -A TP_RULE -j TP_MARK

iptables -w 2 -t mangle -A TP_MARK -p tcp -m tcp --syn -j MARK --set-xmark 0x40/0x40
iptables -w 2 -t mangle -A TP_MARK -p udp -m conntrack --ctstate NEW -j MARK --set-xmark 0x40/0x40
iptables -w 2 -t mangle -A TP_MARK -j CONNMARK --save-mark
"#;

const TPROXY_CLEAN: &str = r#"
ip rule del fwmark 0x40/0xc0 table 100
ip route del local 0.0.0.0/0 dev lo table 100
iptables -w 2 -t mangle -D OUTPUT -j TP_OUT
iptables -w 2 -t mangle -D PREROUTING -j TP_PRE
iptables -w 2 -t mangle -F TP_OUT
iptables -w 2 -t mangle -X TP_OUT
iptables -w 2 -t mangle -F TP_PRE
iptables -w 2 -t mangle -X TP_PRE
iptables -w 2 -t mangle -F TP_RULE
iptables -w 2 -t mangle -X TP_RULE
iptables -w 2 -t mangle -F TP_MARK
iptables -w 2 -t mangle -X TP_MARK
"#;

const REDIRECT_SETUP: &str = r#"
iptables -w 2 -t nat -N TP_OUT
iptables -w 2 -t nat -N TP_PRE
iptables -w 2 -t nat -N TP_RULE
iptables -w 2 -t nat -I OUTPUT -j TP_OUT
iptables -w 2 -t nat -I PREROUTING -j TP_PRE

iptables -w 2 -t nat -A TP_OUT -m mark --mark 0x80/0x80 -j RETURN
iptables -w 2 -t nat -A TP_OUT -p tcp -m multiport --sports {{TCP_PORTS}} -j RETURN
iptables -w 2 -t nat -A TP_OUT -p udp -m multiport --sports {{UDP_PORTS}} -j RETURN
iptables -w 2 -t nat -A TP_OUT -m addrtype --src-type LOCAL ! --dst-type LOCAL -j TP_RULE
iptables -w 2 -t nat -A TP_PRE -m addrtype ! --src-type LOCAL ! --dst-type LOCAL -j TP_RULE

iptables -w 2 -t nat -A TP_RULE -i docker+ -j RETURN
iptables -w 2 -t nat -A TP_RULE -i veth+ -j RETURN
iptables -w 2 -t nat -A TP_RULE -d 0.0.0.0/32 -j RETURN
iptables -w 2 -t nat -A TP_RULE -d 10.0.0.0/8 -j RETURN
iptables -w 2 -t nat -A TP_RULE -d 100.64.0.0/10 -j RETURN
iptables -w 2 -t nat -A TP_RULE -d 127.0.0.0/8 -j RETURN
iptables -w 2 -t nat -A TP_RULE -d 169.254.0.0/16 -j RETURN
iptables -w 2 -t nat -A TP_RULE -d 172.16.0.0/12 -j RETURN
iptables -w 2 -t nat -A TP_RULE -d 192.168.0.0/16 -j RETURN
iptables -w 2 -t nat -A TP_RULE -d 224.0.0.0/4 -j RETURN
iptables -w 2 -t nat -A TP_RULE -d 240.0.0.0/4 -j RETURN
iptables -w 2 -t nat -A TP_RULE -p tcp -j REDIRECT --to-ports 32345
iptables -w 2 -t nat -A TP_RULE -p udp --dport 53 -j REDIRECT --to-ports 32345
"#;

const REDIRECT_CLEAN: &str = r#"
iptables -w 2 -t nat -D OUTPUT -j TP_OUT
iptables -w 2 -t nat -D PREROUTING -j TP_PRE
iptables -w 2 -t nat -F TP_OUT
iptables -w 2 -t nat -X TP_OUT
iptables -w 2 -t nat -F TP_PRE
iptables -w 2 -t nat -X TP_PRE
iptables -w 2 -t nat -F TP_RULE
iptables -w 2 -t nat -X TP_RULE
"#;

// Forged answers typically carry IP id 0, or set QR with an empty answer section.
const DROP_SPOOFING_SETUP: &str = r#"
iptables -w 2 -N DROP_SPOOFING
iptables -w 2 -I INPUT -j DROP_SPOOFING
iptables -w 2 -I FORWARD -j DROP_SPOOFING
iptables -w 2 -A DROP_SPOOFING -p udp --sport 53 -m u32 --u32 "2&0xFFFF=0x0" -j DROP
iptables -w 2 -A DROP_SPOOFING -p udp --sport 53 -m u32 --u32 "0>>22&0x3C@8&0x8000=0x8000&&0>>22&0x3C@14=0" -j DROP
"#;

const DROP_SPOOFING_CLEAN: &str = r#"
iptables -w 2 -D INPUT -j DROP_SPOOFING
iptables -w 2 -D FORWARD -j DROP_SPOOFING
iptables -w 2 -F DROP_SPOOFING
iptables -w 2 -X DROP_SPOOFING
"#;
