//! Resolver hijack: point the system resolver at the proxy's DNS responder
//! and put the original file back afterwards.
//!
//! The backup file doubles as the "currently hijacked" marker, so it only ever
//! exists while the live resolver file holds our replacement.

use log::{debug, info, warn};
use std::{
    fs,
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use crate::error::{Result, TransparentError};

pub const RESOLVER_FILE: &str = "/etc/resolv.conf";
pub const BACKUP_SUFFIX: &str = ".tpctlbak";
/// Answered by the proxy's own DNS inbound once traffic is intercepted.
pub const HIJACK_NAMESERVER: &str = "2.0.1.7";

#[derive(Debug, Clone)]
pub struct DnsRedirector {
    resolver: PathBuf,
    backup: PathBuf,
    nameserver: String,
}

impl Default for DnsRedirector {
    fn default() -> Self {
        Self::new(RESOLVER_FILE, HIJACK_NAMESERVER)
    }
}

impl DnsRedirector {
    /// Backup lives next to `resolver` with [`BACKUP_SUFFIX`] appended.
    pub fn new(resolver: impl Into<PathBuf>, nameserver: impl Into<String>) -> Self {
        let resolver = resolver.into();
        let mut backup = resolver.clone().into_os_string();
        backup.push(BACKUP_SUFFIX);
        Self {
            resolver,
            backup: PathBuf::from(backup),
            nameserver: nameserver.into(),
        }
    }

    pub fn with_backup(mut self, backup: impl Into<PathBuf>) -> Self {
        self.backup = backup.into();
        self
    }

    pub fn resolver_path(&self) -> &Path {
        &self.resolver
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub fn is_hijacked(&self) -> bool {
        self.backup.exists()
    }

    pub fn hijack(&self) -> Result<()> {
        self.hijack_with(|| self.write_replacement())
    }

    fn hijack_with(&self, write: impl FnOnce() -> io::Result<()>) -> Result<()> {
        // A crashed earlier run may have left its backup behind.
        self.restore();

        fs::copy(&self.resolver, &self.backup).map_err(|e| io_err("copy", e))?;
        fs::remove_file(&self.resolver).map_err(|e| io_err("remove", e))?;

        if let Err(e) = write() {
            // Without the live file there is nothing the backup could witness.
            let _ = fs::remove_file(&self.backup);
            return Err(io_err("write", e));
        }
        info!("system dns hijacked -> nameserver {}", self.nameserver);
        Ok(())
    }

    /// Best-effort: never fails. A failed copy keeps the backup for a later retry.
    pub fn restore(&self) {
        match fs::copy(&self.backup, &self.resolver) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound && !self.backup.exists() => {
                debug!("no resolver backup at {}; nothing to restore", self.backup.display());
                return;
            }
            Err(e) => {
                warn!(
                    "restore {} from {} failed: {e}",
                    self.resolver.display(),
                    self.backup.display()
                );
                return;
            }
        }
        if let Err(e) = fs::remove_file(&self.backup) {
            warn!("remove resolver backup {} failed: {e}", self.backup.display());
            return;
        }
        info!("system dns restored");
    }

    fn write_replacement(&self) -> io::Result<()> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&self.resolver)?;
        writeln!(f, "nameserver {}", self.nameserver)?;
        f.flush()
    }
}

fn io_err(step: &'static str, source: io::Error) -> TransparentError {
    TransparentError::Io { step, source }
}
