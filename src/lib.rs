//! Transparent proxy interception control.
//!
//! [`transparent::Transparent`] drives the lifecycle; the rest are the pieces
//! it is built from.

pub mod cli;
pub mod config;
pub mod dns;
pub mod error;
pub mod iptables;
pub mod logging;
pub mod netstat;
pub mod settings;
pub mod shell;
pub mod transparent;

pub use error::TransparentError;
pub use transparent::Transparent;
