// Endpoint identifiers
//
// EIDs name bundle sources, destinations, custodians and registration
// endpoints. Three schemes are supported: `ipn` and `imc` decompose to
// a pair of 64-bit integers, `dtn` carries an authority and path. The
// distinguished null EID is `dtn:none`.

use crate::error::{DtnError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointId {
    Null,
    Ipn { node: u64, service: u64 },
    Imc { group: u64, service: u64 },
    Dtn { authority: String, path: String },
}

impl Default for EndpointId {
    fn default() -> Self {
        EndpointId::Null
    }
}

impl EndpointId {
    pub fn null() -> Self {
        EndpointId::Null
    }

    pub fn ipn(node: u64, service: u64) -> Self {
        EndpointId::Ipn { node, service }
    }

    pub fn imc(group: u64, service: u64) -> Self {
        EndpointId::Imc { group, service }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, EndpointId::Null)
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            EndpointId::Null => "dtn",
            EndpointId::Ipn { .. } => "ipn",
            EndpointId::Imc { .. } => "imc",
            EndpointId::Dtn { .. } => "dtn",
        }
    }

    /// Node number for ipn/imc EIDs, None for dtn scheme.
    pub fn node_number(&self) -> Option<u64> {
        match self {
            EndpointId::Ipn { node, .. } => Some(*node),
            EndpointId::Imc { group, .. } => Some(*group),
            _ => None,
        }
    }

    /// Service number for ipn/imc EIDs.
    pub fn service_number(&self) -> Option<u64> {
        match self {
            EndpointId::Ipn { service, .. } | EndpointId::Imc { service, .. } => Some(*service),
            _ => None,
        }
    }

    /// Same node as `other`, ignoring the service number.
    pub fn same_node(&self, other: &EndpointId) -> bool {
        match (self, other) {
            (EndpointId::Ipn { node: a, .. }, EndpointId::Ipn { node: b, .. }) => a == b,
            (EndpointId::Imc { group: a, .. }, EndpointId::Imc { group: b, .. }) => a == b,
            (
                EndpointId::Dtn { authority: a, .. },
                EndpointId::Dtn { authority: b, .. },
            ) => a == b,
            _ => false,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s == "dtn:none" {
            return Ok(EndpointId::Null);
        }
        if let Some(rest) = s.strip_prefix("ipn:") {
            let (node, service) = parse_num_pair(rest)?;
            return Ok(EndpointId::Ipn { node, service });
        }
        if let Some(rest) = s.strip_prefix("imc:") {
            let (group, service) = parse_num_pair(rest)?;
            return Ok(EndpointId::Imc { group, service });
        }
        if let Some(rest) = s.strip_prefix("dtn://") {
            let (authority, path) = match rest.find('/') {
                Some(idx) => (rest[..idx].to_string(), rest[idx..].to_string()),
                None => (rest.to_string(), String::new()),
            };
            if authority.is_empty() {
                return Err(DtnError::Naming(format!("empty authority in '{}'", s)));
            }
            return Ok(EndpointId::Dtn { authority, path });
        }
        Err(DtnError::Naming(format!("unrecognized EID '{}'", s)))
    }
}

fn parse_num_pair(s: &str) -> Result<(u64, u64)> {
    let (a, b) = s
        .split_once('.')
        .ok_or_else(|| DtnError::Naming(format!("expected node.service in '{}'", s)))?;
    let node = a
        .parse::<u64>()
        .map_err(|_| DtnError::Naming(format!("bad node number '{}'", a)))?;
    let service = b
        .parse::<u64>()
        .map_err(|_| DtnError::Naming(format!("bad service number '{}'", b)))?;
    Ok((node, service))
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Null => write!(f, "dtn:none"),
            EndpointId::Ipn { node, service } => write!(f, "ipn:{}.{}", node, service),
            EndpointId::Imc { group, service } => write!(f, "imc:{}.{}", group, service),
            EndpointId::Dtn { authority, path } => write!(f, "dtn://{}{}", authority, path),
        }
    }
}

/// Endpoint pattern with an optional wildcard tail.
///
/// `ipn:5.*` matches any service on node 5, `dtn://host/*` matches any
/// path under the authority, and the bare `*` matches everything.
/// `match_len` orders overlapping patterns so callers can pick the most
/// specific one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EidPattern {
    Any,
    Exact(EndpointId),
    IpnNode(u64),
    ImcGroup(u64),
    DtnPrefix { authority: String, path_prefix: String },
}

impl EidPattern {
    pub fn parse(s: &str) -> Result<Self> {
        if s == "*" || s == "*:*" {
            return Ok(EidPattern::Any);
        }
        if let Some(rest) = s.strip_prefix("ipn:") {
            if let Some(node) = rest.strip_suffix(".*") {
                let node = node
                    .parse::<u64>()
                    .map_err(|_| DtnError::Naming(format!("bad node number '{}'", node)))?;
                return Ok(EidPattern::IpnNode(node));
            }
        }
        if let Some(rest) = s.strip_prefix("imc:") {
            if let Some(group) = rest.strip_suffix(".*") {
                let group = group
                    .parse::<u64>()
                    .map_err(|_| DtnError::Naming(format!("bad group number '{}'", group)))?;
                return Ok(EidPattern::ImcGroup(group));
            }
        }
        if s.starts_with("dtn://") {
            if let Some(prefix) = s.strip_suffix('*') {
                let rest = &prefix["dtn://".len()..];
                let (authority, path_prefix) = match rest.find('/') {
                    Some(idx) => (rest[..idx].to_string(), rest[idx..].to_string()),
                    None => (rest.to_string(), String::new()),
                };
                return Ok(EidPattern::DtnPrefix {
                    authority,
                    path_prefix,
                });
            }
        }
        Ok(EidPattern::Exact(EndpointId::parse(s)?))
    }

    pub fn matches(&self, eid: &EndpointId) -> bool {
        match self {
            EidPattern::Any => true,
            EidPattern::Exact(pat) => pat == eid,
            EidPattern::IpnNode(node) => {
                matches!(eid, EndpointId::Ipn { node: n, .. } if n == node)
            }
            EidPattern::ImcGroup(group) => {
                matches!(eid, EndpointId::Imc { group: g, .. } if g == group)
            }
            EidPattern::DtnPrefix {
                authority,
                path_prefix,
            } => match eid {
                EndpointId::Dtn { authority: a, path } => {
                    a == authority && path.starts_with(path_prefix.as_str())
                }
                _ => false,
            },
        }
    }

    /// Specificity used for longest-match ordering; higher wins.
    pub fn match_len(&self) -> usize {
        match self {
            EidPattern::Any => 0,
            EidPattern::IpnNode(_) | EidPattern::ImcGroup(_) => 8,
            EidPattern::DtnPrefix {
                authority,
                path_prefix,
            } => authority.len() + path_prefix.len(),
            EidPattern::Exact(eid) => eid.to_string().len() + 256,
        }
    }
}

impl fmt::Display for EidPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EidPattern::Any => write!(f, "*"),
            EidPattern::Exact(eid) => write!(f, "{}", eid),
            EidPattern::IpnNode(node) => write!(f, "ipn:{}.*", node),
            EidPattern::ImcGroup(group) => write!(f, "imc:{}.*", group),
            EidPattern::DtnPrefix {
                authority,
                path_prefix,
            } => write!(f, "dtn://{}{}*", authority, path_prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for s in ["dtn:none", "ipn:1.1", "imc:7.0", "dtn://node-a/svc"] {
            let eid = EndpointId::parse(s).unwrap();
            assert_eq!(eid.to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(EndpointId::parse("ipn:1").is_err());
        assert!(EndpointId::parse("ipn:x.y").is_err());
        assert!(EndpointId::parse("http://nope").is_err());
        assert!(EndpointId::parse("dtn:///empty").is_err());
    }

    #[test]
    fn test_pattern_matching() {
        let pat = EidPattern::parse("ipn:5.*").unwrap();
        assert!(pat.matches(&EndpointId::ipn(5, 0)));
        assert!(pat.matches(&EndpointId::ipn(5, 99)));
        assert!(!pat.matches(&EndpointId::ipn(6, 0)));

        let pat = EidPattern::parse("dtn://host/app*").unwrap();
        assert!(pat.matches(&EndpointId::parse("dtn://host/app").unwrap()));
        assert!(pat.matches(&EndpointId::parse("dtn://host/app/x").unwrap()));
        assert!(!pat.matches(&EndpointId::parse("dtn://other/app").unwrap()));

        assert!(EidPattern::Any.matches(&EndpointId::null()));
    }

    #[test]
    fn test_match_len_ordering() {
        let exact = EidPattern::parse("ipn:5.1").unwrap();
        let node = EidPattern::parse("ipn:5.*").unwrap();
        assert!(exact.match_len() > node.match_len());
        assert!(node.match_len() > EidPattern::Any.match_len());
    }
}
