use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use tpctl::{
    cli::{Args, Command},
    config::Config,
    iptables::{template, IptablesRules},
    logging, Transparent,
};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.command.needs_root() && unsafe { libc::geteuid() } != 0 {
        eprintln!("tpctl: root privileges are required");
        anyhow::bail!("root privileges are required");
    }

    let cfg = match &args.config {
        Some(p) => Config::load(p)?,
        None => Config::default_fixed(),
    };

    logging::init(&cfg.log)?;

    match args.command {
        Command::Enable { check_running } => {
            info!("tpctl enable (check_running={check_running})");
            let mut tp = Transparent::from_config(&cfg);
            tp.enable(check_running)?;
        }
        Command::Disable => {
            info!("tpctl disable");
            Transparent::without_probe(&cfg).disable();
        }
        Command::Preview { strategy } => {
            let tp = Transparent::without_probe(&cfg);
            let (whitelist, opts) = tp.rule_inputs(&tp.settings()?)?;
            let raw = IptablesRules::new(cfg.paths.templates_dir.clone())
                .setup_template(strategy)
                .with_context(|| format!("load {strategy} template"))?;
            println!("{}", template::preprocess(&raw, &whitelist, &opts));
        }
        Command::Status => {
            let tp = Transparent::from_config(&cfg);
            let setting = tp.settings()?;
            let (_, opts) = tp.rule_inputs(&setting)?;
            println!("transparent:      {:?}", setting.transparent);
            println!("anti_pollution:   {:?}", setting.anti_pollution);
            println!("drop_spoofing:    {}", opts.drop_spoofing);
            println!("tproxy_supported: {}", tp.caps().tproxy());
            println!("dns_hijacked:     {}", tp.dns().is_hijacked());
            println!("{:<17} {}", format!("{}_running:", cfg.proxy.process_name), tp.proxy_running());
        }
    }
    Ok(())
}
