pub mod caps;
pub mod ports;
pub mod rules;
pub mod template;

pub use caps::HostCaps;
pub use rules::{IptablesRules, RuleService, Strategy, CONTROL_PORT};
