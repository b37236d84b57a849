use std::{fmt, str::FromStr};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

/// iptables `multiport` accepts at most 15 ports per rule; a range counts twice.
pub const MULTIPORT_BUDGET: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    pub fn as_str(self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }
}

/// A single port (`80`) or an inclusive range (`6881:6999`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
}

impl PortSpec {
    /// Argument cost of this specifier inside a `multiport` match.
    pub fn cost(&self) -> usize {
        match self {
            PortSpec::Single(_) => 1,
            PortSpec::Range(..) => 2,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(p) => write!(f, "{p}"),
            PortSpec::Range(a, b) => write!(f, "{a}:{b}"),
        }
    }
}

fn parse_port(s: &str) -> Result<u16> {
    let p: u16 = s
        .trim()
        .parse()
        .map_err(|e| anyhow!("bad port {s:?}: {e}"))?;
    if p == 0 {
        bail!("port 0 is not allowed");
    }
    Ok(p)
}

impl FromStr for PortSpec {
    type Err = anyhow::Error;

    /// Accepts both `:` and `-` as the range separator.
    fn from_str(s: &str) -> Result<Self> {
        let t = s.trim();
        match t.split_once(':').or_else(|| t.split_once('-')) {
            Some((a, b)) => {
                let (a, b) = (parse_port(a)?, parse_port(b)?);
                if a == b {
                    Ok(PortSpec::Single(a))
                } else {
                    Ok(PortSpec::Range(a.min(b), a.max(b)))
                }
            }
            None => Ok(PortSpec::Single(parse_port(t)?)),
        }
    }
}

impl TryFrom<String> for PortSpec {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PortSpec> for String {
    fn from(p: PortSpec) -> Self {
        p.to_string()
    }
}

/// Split off the longest prefix of `ports` whose cost fits in `budget`.
///
/// Returns `None` for an empty list. A specifier is never split; one that is
/// on its own more expensive than `budget` becomes a group by itself so that
/// repeated calls always make progress.
pub fn next_group(ports: &[PortSpec], budget: usize) -> Option<(&[PortSpec], &[PortSpec])> {
    if ports.is_empty() {
        return None;
    }
    let mut cost = 0usize;
    for (i, p) in ports.iter().enumerate() {
        cost += p.cost();
        if cost == budget {
            return Some(ports.split_at(i + 1));
        }
        if cost > budget {
            return Some(ports.split_at(i.max(1)));
        }
    }
    Some((ports, &ports[ports.len()..]))
}

/// Iterate all groups of `ports` under `budget`, in order.
pub fn groups(ports: &[PortSpec], budget: usize) -> Groups<'_> {
    Groups { rest: ports, budget }
}

pub struct Groups<'a> {
    rest: &'a [PortSpec],
    budget: usize,
}

impl<'a> Iterator for Groups<'a> {
    type Item = &'a [PortSpec];

    fn next(&mut self) -> Option<Self::Item> {
        let (group, rest) = next_group(self.rest, self.budget)?;
        self.rest = rest;
        Some(group)
    }
}

pub fn join_csv(group: &[PortSpec]) -> String {
    group
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
