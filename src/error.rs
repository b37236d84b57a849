//! Error taxonomy for enabling transparent interception.

use std::io;

use thiserror::Error;

/// Failures surfaced by [`crate::transparent::Transparent`] and the resolver hijack.
#[derive(Debug, Error)]
pub enum TransparentError {
    /// A file step of the resolver hijack failed (`copy`, `remove` or `write`).
    #[error("cannot hijack system dns: [{step}] {source}")]
    Io {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    /// The control port is bound by a process other than the proxy.
    #[error("transparent proxy cannot be set up, port {port} is occupied by {process}")]
    PortConflict { port: u16, process: String },

    /// The kernel lacks the packet-filter extension a strategy needs.
    /// The raw rule-service error is kept as the source.
    #[error("kernel lacks xt_TPROXY support: {0:#}")]
    Capability(#[source] anyhow::Error),

    /// The last-resort strategy could not be applied.
    #[error("not support transparent proxy: {0:#}")]
    Unsupported(#[source] anyhow::Error),

    /// Settings, whitelist or socket introspection failures.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TransparentError>;
