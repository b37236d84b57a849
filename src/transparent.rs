//! Enable/disable transparent interception.
//!
//! Enabling runs a pre-flight check on the control port, tears down whatever
//! was there before and then walks the strategy cascade:
//!
//! 1. drop-spoofing, best effort, when the DNS-poison policy asks for it;
//! 2. TPROXY when the host supports it and enhanced mode is off, followed by
//!    the resolver hijack when anti-pollution is on;
//! 3. REDIRECT otherwise, as the last resort.
//!
//! A failed TPROXY setup downgrades [`HostCaps`] for the lifetime of this
//! [`Transparent`], so the next `enable` goes straight to REDIRECT.

use anyhow::Context;
use log::{debug, info, warn};
use std::{thread, time::Duration};

use crate::{
    config::Config,
    dns::DnsRedirector,
    error::{Result, TransparentError},
    iptables::{
        ports::Proto,
        template::{self, RuleOptions},
        HostCaps, IptablesRules, RuleService, Strategy, CONTROL_PORT,
    },
    netstat::{ProcNet, ProcessProbe, SocketInspector},
    settings::{AntiPollutionMode, DnsPoisonPolicy, InterceptionMode, JsonStore, PortWhitelist, Settings, SettingsStore},
};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Decides whether a TPROXY setup error means the kernel lacks the target.
pub type Classifier = Box<dyn Fn(&anyhow::Error) -> bool>;

/// iptables reports an unloadable target as "No chain/target/match by that
/// name"; the failing command line names TPROXY.
pub fn missing_tproxy_extension(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}");
    msg.contains("TPROXY") && msg.contains("No chain")
}

/// The collaborators the orchestrator drives.
pub struct Backends {
    pub store: Box<dyn SettingsStore>,
    pub poison: Box<dyn DnsPoisonPolicy>,
    pub rules: Box<dyn RuleService>,
    pub sockets: Box<dyn SocketInspector>,
    pub processes: Box<dyn ProcessProbe>,
}

pub struct Transparent {
    backends: Backends,
    dns: DnsRedirector,
    caps: HostCaps,
    classifier: Classifier,
    proxy_name: String,
    settle_delay: Duration,
}

impl Transparent {
    pub fn new(backends: Backends, dns: DnsRedirector, caps: HostCaps, proxy_name: impl Into<String>) -> Self {
        Self {
            backends,
            dns,
            caps,
            classifier: Box::new(missing_tproxy_extension),
            proxy_name: proxy_name.into(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    /// Real backends: JSON store, iptables, procfs, and a TPROXY probe unless
    /// the config forces the answer.
    pub fn from_config(cfg: &Config) -> Self {
        let caps = match cfg.tproxy {
            Some(v) => HostCaps::new(v),
            None => HostCaps::probe(),
        };
        Self::with_caps(cfg, caps)
    }

    /// Like [`Transparent::from_config`] but never spawns the TPROXY probe.
    /// Good for teardown and previews, which do not look at the capability.
    pub fn without_probe(cfg: &Config) -> Self {
        Self::with_caps(cfg, HostCaps::new(false))
    }

    fn with_caps(cfg: &Config, caps: HostCaps) -> Self {
        let store = JsonStore::new(&cfg.paths.settings, &cfg.paths.whitelist);
        let backends = Backends {
            store: Box::new(store.clone()),
            poison: Box::new(store),
            rules: Box::new(IptablesRules::new(cfg.paths.templates_dir.clone())),
            sockets: Box::new(ProcNet::default()),
            processes: Box::new(ProcNet::default()),
        };
        let mut dns = DnsRedirector::new(&cfg.paths.resolver, cfg.proxy.nameserver.clone());
        if let Some(b) = &cfg.paths.resolver_backup {
            dns = dns.with_backup(b);
        }
        Self::new(backends, dns, caps, cfg.proxy.process_name.clone()).with_settle_delay(cfg.settle_delay())
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn caps(&self) -> HostCaps {
        self.caps
    }

    pub fn dns(&self) -> &DnsRedirector {
        &self.dns
    }

    pub fn proxy_running(&self) -> bool {
        self.backends.processes.is_running(&self.proxy_name)
    }

    pub fn settings(&self) -> Result<Settings> {
        Ok(self.backends.store.settings()?)
    }

    /// Whitelist and preprocessor inputs derived from one settings snapshot.
    pub fn rule_inputs(&self, setting: &Settings) -> Result<(PortWhitelist, RuleOptions)> {
        let whitelist = self.backends.store.whitelist()?;
        let opts = RuleOptions {
            self_port: setting.listen_port()?,
            anti_pollution: setting.anti_pollution != AntiPollutionMode::Closed,
            drop_spoofing: self.backends.poison.should_enable(setting),
        };
        Ok((whitelist, opts))
    }

    /// Set up transparent interception according to the current settings.
    ///
    /// With `check_running`, nothing happens unless the proxy process is up.
    pub fn enable(&mut self, check_running: bool) -> Result<()> {
        let setting = self.settings()?;
        if setting.transparent == InterceptionMode::Closed {
            debug!("transparent proxy is closed; nothing to enable");
            return Ok(());
        }
        if check_running && !self.proxy_running() {
            debug!("{} is not running; skip transparent proxy", self.proxy_name);
            return Ok(());
        }

        self.check_control_port()?;

        let (whitelist, opts) = self.rule_inputs(&setting)?;
        let preprocess = move |raw: &str| template::preprocess(raw, &whitelist, &opts);

        self.disable();
        self.write_rules(&setting, opts.drop_spoofing, &preprocess)
    }

    /// Remove every strategy's rules and put the resolver back. Never fails.
    pub fn disable(&self) {
        for strategy in Strategy::ALL {
            self.backends.rules.clean(strategy);
        }
        self.dns.restore();
        thread::sleep(self.settle_delay);
    }

    fn check_control_port(&self) -> Result<()> {
        let occupied = self
            .backends
            .sockets
            .occupied(CONTROL_PORT, &[Proto::Tcp, Proto::Udp])
            .context("check control port")?;
        let Some(socket) = occupied else {
            return Ok(());
        };
        match self.backends.sockets.owner(&socket) {
            Ok(p) if p.name != self.proxy_name => Err(TransparentError::PortConflict {
                port: CONTROL_PORT,
                process: p.name,
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                // Usually permissions; not worth blocking on.
                debug!("owner of port {CONTROL_PORT} unknown: {e:#}");
                Ok(())
            }
        }
    }

    fn write_rules(&mut self, setting: &Settings, drop_spoofing: bool, preprocess: &dyn Fn(&str) -> String) -> Result<()> {
        let rules = &self.backends.rules;

        if drop_spoofing {
            if let Err(e) = rules.setup(Strategy::DropSpoofing, preprocess) {
                warn!("DropSpoofing can't be enabled: {e:#}");
                rules.clean(Strategy::DropSpoofing);
            }
        }

        if self.caps.tproxy() && !setting.enhanced_mode {
            match rules.setup(Strategy::Tproxy, preprocess) {
                Ok(()) => {
                    if setting.anti_pollution != AntiPollutionMode::Closed {
                        self.dns.hijack()?;
                    }
                    info!("transparent proxy enabled (tproxy)");
                }
                Err(e) => {
                    let err = if (self.classifier)(&e) {
                        TransparentError::Capability(e)
                    } else {
                        TransparentError::Other(e)
                    };
                    self.disable();
                    warn!("{err:#}");
                    self.caps.downgrade_tproxy();
                }
            }
            return Ok(());
        }

        if let Err(e) = rules.setup(Strategy::Redirect, preprocess) {
            warn!("{e:#}");
            self.disable();
            return Err(TransparentError::Unsupported(e));
        }
        info!("transparent proxy enabled (redirect)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iptables::ports::PortSpec;
    use crate::netstat::{Process, Socket};
    use anyhow::anyhow;
    use std::{
        cell::{Cell, RefCell},
        fs,
        rc::Rc,
    };
    use tempfile::TempDir;

    type Log = Rc<RefCell<Vec<String>>>;

    struct FakeStore {
        settings: Settings,
        whitelist: PortWhitelist,
        drop_spoofing: bool,
        reads: Cell<usize>,
    }

    struct SharedStore(Rc<FakeStore>);

    impl SettingsStore for SharedStore {
        fn settings(&self) -> anyhow::Result<Settings> {
            self.0.reads.set(self.0.reads.get() + 1);
            Ok(self.0.settings.clone())
        }
        fn whitelist(&self) -> anyhow::Result<PortWhitelist> {
            Ok(self.0.whitelist.clone())
        }
    }

    impl DnsPoisonPolicy for SharedStore {
        fn should_enable(&self, _settings: &Settings) -> bool {
            self.0.drop_spoofing
        }
    }

    const RAW: &str = "rule {{TCP_PORTS}}\nudp {{UDP_PORTS}}\nskip 240.0.0.0/4";

    /// Records calls; fails setup for the listed strategies with the given text.
    struct FakeRules {
        log: Log,
        fail: Vec<(Strategy, &'static str)>,
    }

    impl RuleService for FakeRules {
        fn setup(&self, strategy: Strategy, preprocess: &dyn Fn(&str) -> String) -> anyhow::Result<()> {
            let out = preprocess(RAW);
            self.log.borrow_mut().push(format!("setup {strategy}: {}", out.replace('\n', " | ")));
            match self.fail.iter().find(|(s, _)| *s == strategy) {
                Some((_, msg)) => Err(anyhow!("{msg}")),
                None => Ok(()),
            }
        }
        fn clean(&self, strategy: Strategy) {
            self.log.borrow_mut().push(format!("clean {strategy}"));
        }
    }

    struct FakeSockets {
        owner: Option<anyhow::Result<&'static str>>,
    }

    impl SocketInspector for FakeSockets {
        fn occupied(&self, port: u16, _protos: &[Proto]) -> anyhow::Result<Option<Socket>> {
            Ok(self.owner.as_ref().map(|_| Socket { proto: Proto::Tcp, local_port: port, inode: 1 }))
        }
        fn owner(&self, _socket: &Socket) -> anyhow::Result<Process> {
            match &self.owner {
                Some(Ok(name)) => Ok(Process { pid: 42, name: name.to_string() }),
                _ => Err(anyhow!("permission denied")),
            }
        }
    }

    struct FakeProcesses(bool);

    impl ProcessProbe for FakeProcesses {
        fn is_running(&self, _name: &str) -> bool {
            self.0
        }
    }

    struct Harness {
        _dir: TempDir,
        log: Log,
        store: Rc<FakeStore>,
        tp: Transparent,
    }

    const RESOLV: &str = "nameserver 9.9.9.9\n";

    fn settings(anti_pollution: AntiPollutionMode) -> Settings {
        Settings {
            transparent: InterceptionMode::Proxy,
            anti_pollution,
            enhanced_mode: false,
            listen_address: "127.0.0.1:2017".into(),
            drop_spoofing: false,
        }
    }

    fn harness(
        settings: Settings,
        tproxy: bool,
        fail: Vec<(Strategy, &'static str)>,
        owner: Option<anyhow::Result<&'static str>>,
        drop_spoofing: bool,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let resolver = dir.path().join("resolv.conf");
        fs::write(&resolver, RESOLV).unwrap();
        let log: Log = Rc::default();
        let store = Rc::new(FakeStore {
            settings,
            whitelist: PortWhitelist {
                tcp: vec![PortSpec::Single(80), PortSpec::Single(443)],
                udp: vec![],
            },
            drop_spoofing,
            reads: Cell::new(0),
        });
        let backends = Backends {
            store: Box::new(SharedStore(store.clone())),
            poison: Box::new(SharedStore(store.clone())),
            rules: Box::new(FakeRules { log: log.clone(), fail }),
            sockets: Box::new(FakeSockets { owner }),
            processes: Box::new(FakeProcesses(true)),
        };
        let tp = Transparent::new(backends, DnsRedirector::new(&resolver, "2.0.1.7"), HostCaps::new(tproxy), "v2ray")
            .with_settle_delay(Duration::ZERO);
        Harness { _dir: dir, log, store, tp }
    }

    fn calls(h: &Harness) -> Vec<String> {
        h.log.borrow().clone()
    }

    fn setups(h: &Harness) -> Vec<String> {
        calls(h).into_iter().filter(|c| c.starts_with("setup")).collect()
    }

    fn resolver(h: &Harness) -> String {
        fs::read_to_string(h.tp.dns().resolver_path()).unwrap()
    }

    const CLEAN_ALL: [&str; 3] = ["clean tproxy", "clean redirect", "clean drop-spoofing"];

    #[test]
    fn tproxy_with_anti_pollution_hijacks_dns() {
        let mut h = harness(settings(AntiPollutionMode::Enabled), true, vec![], None, false);
        h.tp.enable(false).unwrap();
        let c = calls(&h);
        assert_eq!(&c[..3], &CLEAN_ALL);
        assert_eq!(c[3], "setup tproxy: rule 80,443,2017 | skip 240.0.0.0/4");
        assert_eq!(c.len(), 4);
        assert!(h.tp.dns().is_hijacked());
        assert_eq!(resolver(&h), "nameserver 2.0.1.7\n");
    }

    #[test]
    fn tproxy_without_anti_pollution_leaves_dns() {
        let mut h = harness(settings(AntiPollutionMode::Closed), true, vec![], None, false);
        h.tp.enable(false).unwrap();
        assert_eq!(setups(&h), vec!["setup tproxy: rule 80,443,2017 | skip 240.0.0.0/4"]);
        assert!(!h.tp.dns().is_hijacked());
        assert_eq!(resolver(&h), RESOLV);
    }

    #[test]
    fn missing_tproxy_target_downgrades_to_redirect() {
        let fail = vec![(
            Strategy::Tproxy,
            "command failed (1): iptables -j TPROXY --on-port 32345 | out=iptables: No chain/target/match by that name.",
        )];
        let mut h = harness(settings(AntiPollutionMode::Enabled), true, fail, None, false);
        h.tp.enable(false).unwrap();
        assert!(!h.tp.caps().tproxy());
        let c = calls(&h);
        // Pre-setup teardown, failed setup, then the full cleanup again.
        assert_eq!(&c[4..], &CLEAN_ALL);
        assert!(!h.tp.dns().is_hijacked());

        h.log.borrow_mut().clear();
        h.tp.enable(false).unwrap();
        let s = setups(&h);
        assert_eq!(s.len(), 1);
        assert!(s[0].starts_with("setup redirect"));
    }

    #[test]
    fn any_tproxy_failure_downgrades() {
        let fail = vec![(Strategy::Tproxy, "ip: RTNETLINK answers: Operation not permitted")];
        let mut h = harness(settings(AntiPollutionMode::Closed), true, fail, None, false);
        h.tp.enable(false).unwrap();
        assert!(!h.tp.caps().tproxy());
    }

    #[test]
    fn classifier_is_pluggable() {
        assert!(missing_tproxy_extension(&anyhow!("TPROXY: No chain/target/match")));
        assert!(!missing_tproxy_extension(&anyhow!("No chain/target/match")));
        let h = harness(settings(AntiPollutionMode::Closed), true, vec![], None, false);
        let tp = h.tp.with_classifier(Box::new(|e: &anyhow::Error| e.to_string().contains("xt_TPROXY")));
        assert!((tp.classifier)(&anyhow!("module xt_TPROXY not found")));
    }

    #[test]
    fn enhanced_mode_uses_redirect() {
        let mut st = settings(AntiPollutionMode::Enabled);
        st.enhanced_mode = true;
        let mut h = harness(st, true, vec![], None, false);
        h.tp.enable(false).unwrap();
        let s = setups(&h);
        assert_eq!(s, vec!["setup redirect: rule 80,443,2017 | skip 240.0.0.0/4"]);
        assert!(!h.tp.dns().is_hijacked());
        assert!(h.tp.caps().tproxy());
    }

    #[test]
    fn redirect_failure_is_unsupported_and_cleans_up() {
        let fail = vec![(Strategy::Redirect, "iptables: Table does not exist")];
        let mut h = harness(settings(AntiPollutionMode::Closed), false, fail, None, false);
        let err = h.tp.enable(false).unwrap_err();
        assert!(matches!(err, TransparentError::Unsupported(_)));
        assert!(err.to_string().contains("Table does not exist"));
        let c = calls(&h);
        assert_eq!(&c[c.len() - 3..], &CLEAN_ALL);
    }

    #[test]
    fn foreign_owner_of_control_port_blocks_enable() {
        let mut h = harness(settings(AntiPollutionMode::Enabled), true, vec![], Some(Ok("sshd")), false);
        match h.tp.enable(false) {
            Err(TransparentError::PortConflict { port, process }) => {
                assert_eq!(port, 32345);
                assert_eq!(process, "sshd");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(calls(&h).is_empty());
        assert!(!h.tp.dns().is_hijacked());
        assert_eq!(resolver(&h), RESOLV);
    }

    #[test]
    fn proxy_on_control_port_is_fine() {
        let mut h = harness(settings(AntiPollutionMode::Closed), true, vec![], Some(Ok("v2ray")), false);
        h.tp.enable(false).unwrap();
        assert_eq!(setups(&h).len(), 1);
    }

    #[test]
    fn unknown_owner_does_not_block() {
        let mut h = harness(settings(AntiPollutionMode::Closed), true, vec![], Some(Err(anyhow!("x"))), false);
        h.tp.enable(false).unwrap();
        assert_eq!(setups(&h).len(), 1);
    }

    #[test]
    fn closed_mode_is_noop() {
        let mut st = settings(AntiPollutionMode::Enabled);
        st.transparent = InterceptionMode::Closed;
        let mut h = harness(st, true, vec![], Some(Ok("sshd")), false);
        h.tp.enable(false).unwrap();
        assert!(calls(&h).is_empty());
    }

    #[test]
    fn check_running_skips_when_proxy_down() {
        let mut h = harness(settings(AntiPollutionMode::Enabled), true, vec![], None, false);
        h.tp.backends.processes = Box::new(FakeProcesses(false));
        h.tp.enable(true).unwrap();
        assert!(calls(&h).is_empty());
        h.tp.enable(false).unwrap();
        assert_eq!(setups(&h).len(), 1);
    }

    #[test]
    fn drop_spoofing_runs_first_and_trims_exclusion() {
        let mut h = harness(settings(AntiPollutionMode::Enabled), true, vec![], None, true);
        h.tp.enable(false).unwrap();
        let s = setups(&h);
        assert_eq!(s[0], "setup drop-spoofing: rule 80,443,2017");
        assert_eq!(s[1], "setup tproxy: rule 80,443,2017");
    }

    #[test]
    fn drop_spoofing_failure_is_not_fatal() {
        let fail = vec![(Strategy::DropSpoofing, "u32 match unavailable")];
        let mut h = harness(settings(AntiPollutionMode::Closed), true, fail, None, true);
        h.tp.enable(false).unwrap();
        let c = calls(&h);
        assert_eq!(c[4], "clean drop-spoofing");
        assert!(c[5].starts_with("setup tproxy"));
    }

    #[test]
    fn disable_cleans_everything_then_restores_dns() {
        let mut h = harness(settings(AntiPollutionMode::Enabled), true, vec![], None, false);
        h.tp.enable(false).unwrap();
        assert!(h.tp.dns().is_hijacked());
        h.log.borrow_mut().clear();
        h.tp.disable();
        assert_eq!(calls(&h), CLEAN_ALL.to_vec());
        assert!(!h.tp.dns().is_hijacked());
        assert_eq!(resolver(&h), RESOLV);
        // Second teardown is harmless.
        h.tp.disable();
        assert_eq!(resolver(&h), RESOLV);
    }

    #[test]
    fn hijack_failure_is_surfaced_with_rules_left() {
        let mut h = harness(settings(AntiPollutionMode::Enabled), true, vec![], None, false);
        fs::remove_file(h.tp.dns().resolver_path()).unwrap();
        match h.tp.enable(false) {
            Err(TransparentError::Io { step, .. }) => assert_eq!(step, "copy"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls(&h).last().unwrap(), "setup tproxy: rule 80,443,2017 | skip 240.0.0.0/4");
    }

    #[test]
    fn enable_reads_settings_once() {
        let mut h = harness(settings(AntiPollutionMode::Enabled), true, vec![], None, true);
        h.tp.enable(false).unwrap();
        assert_eq!(h.store.reads.get(), 1);
    }

    #[test]
    fn without_probe_never_claims_tproxy() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default_fixed();
        cfg.paths.settings = dir.path().join("settings.json");
        cfg.paths.whitelist = dir.path().join("whitelist.json");
        cfg.paths.resolver = dir.path().join("resolv.conf");
        cfg.tproxy = Some(true);
        assert!(Transparent::from_config(&cfg).caps().tproxy());
        assert!(!Transparent::without_probe(&cfg).caps().tproxy());
        cfg.tproxy = None;
        assert!(!Transparent::without_probe(&cfg).caps().tproxy());
    }
}
