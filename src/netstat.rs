use anyhow::{anyhow, Context, Result};
use log::debug;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::iptables::ports::Proto;

/// A bound local socket found in `/proc/net`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socket {
    pub proto: Proto,
    pub local_port: u16,
    pub inode: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: u32,
    pub name: String,
}

pub trait SocketInspector {
    /// First socket bound to `port` for any of `protos`. TCP only counts when listening.
    fn occupied(&self, port: u16, protos: &[Proto]) -> Result<Option<Socket>>;
    fn owner(&self, socket: &Socket) -> Result<Process>;
}

pub trait ProcessProbe {
    fn is_running(&self, name: &str) -> bool;
}

const TCP_LISTEN: &str = "0A";

/// Reads sockets and processes straight from procfs.
#[derive(Debug, Clone)]
pub struct ProcNet {
    root: PathBuf,
}

impl Default for ProcNet {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcNet {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn tables(proto: Proto) -> &'static [&'static str] {
        match proto {
            Proto::Tcp => &["tcp", "tcp6"],
            Proto::Udp => &["udp", "udp6"],
        }
    }

    fn pids(&self) -> Vec<u32> {
        let Ok(rd) = fs::read_dir(&self.root) else {
            return vec![];
        };
        rd.flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<u32>().ok()))
            .collect()
    }

    fn comm(&self, pid: u32) -> Option<String> {
        let s = fs::read_to_string(self.root.join(pid.to_string()).join("comm")).ok()?;
        Some(s.trim_end_matches('\n').to_string())
    }
}

/// Parse one `/proc/net/{tcp,udp}[6]` table.
fn parse_table(text: &str, proto: Proto) -> Vec<(Socket, String)> {
    let mut out = Vec::new();
    // header: sl local_address rem_address st tx_queue:rx_queue tr:tm->when retrnsmt uid timeout inode
    for line in text.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 10 {
            continue;
        }
        let Some((_, port_hex)) = cols[1].rsplit_once(':') else {
            continue;
        };
        let (Ok(local_port), Ok(inode)) = (u16::from_str_radix(port_hex, 16), cols[9].parse::<u64>())
        else {
            continue;
        };
        out.push((
            Socket {
                proto,
                local_port,
                inode,
            },
            cols[3].to_string(),
        ));
    }
    out
}

fn read_table(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        // tcp6/udp6 vanish when IPv6 is compiled out.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow!("read {}: {e}", path.display())),
    }
}

impl SocketInspector for ProcNet {
    fn occupied(&self, port: u16, protos: &[Proto]) -> Result<Option<Socket>> {
        for &proto in protos {
            for table in Self::tables(proto) {
                let path = self.root.join("net").join(table);
                let Some(text) = read_table(&path)? else {
                    continue;
                };
                for (sock, state) in parse_table(&text, proto) {
                    if sock.local_port != port {
                        continue;
                    }
                    if proto == Proto::Tcp && state != TCP_LISTEN {
                        continue;
                    }
                    debug!("port {port}/{} occupied (inode {})", proto.as_str(), sock.inode);
                    return Ok(Some(sock));
                }
            }
        }
        Ok(None)
    }

    fn owner(&self, socket: &Socket) -> Result<Process> {
        let needle = format!("socket:[{}]", socket.inode);
        for pid in self.pids() {
            let fd_dir = self.root.join(pid.to_string()).join("fd");
            let Ok(rd) = fs::read_dir(&fd_dir) else {
                continue;
            };
            let owns = rd
                .flatten()
                .filter_map(|e| fs::read_link(e.path()).ok())
                .any(|target| target.as_os_str() == needle.as_str());
            if owns {
                let name = self
                    .comm(pid)
                    .with_context(|| format!("read comm of pid {pid}"))?;
                return Ok(Process { pid, name });
            }
        }
        Err(anyhow!(
            "no process owns socket inode {} (port {})",
            socket.inode,
            socket.local_port
        ))
    }
}

impl ProcessProbe for ProcNet {
    fn is_running(&self, name: &str) -> bool {
        self.pids()
            .into_iter()
            .any(|pid| self.comm(pid).as_deref() == Some(name))
    }
}
