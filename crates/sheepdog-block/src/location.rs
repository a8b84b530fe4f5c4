//! VDI locations.
//!
//! A location names the daemon to talk to, the VDI, and optionally a
//! snapshot of it. Two syntaxes are accepted:
//!
//! ```text
//! sheepdog[+tcp]://[host[:port]]/vdi[#snapid|tag]
//! sheepdog+unix:///vdi?socket=path[#snapid|tag]
//! [sheepdog:][host:port:]vdi[:snapid|tag]
//! ```

use std::path::PathBuf;

use sheepdog_core::net::HostSpec;
use sheepdog_proto::constants::{SD_DEFAULT_ADDR, SD_LISTEN_PORT, SD_MAX_VDI_LEN, SD_MAX_VDI_TAG_LEN};
use url::Url;

use crate::error::{DriverError, DriverResult};

/// A parsed VDI location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdiLocation {
    pub host: HostSpec,
    pub vdi: String,
    /// Snapshot id, 0 for the current (writable) VDI.
    pub snap_id: u32,
    /// Snapshot tag, empty when none was given.
    pub tag: String,
}

impl VdiLocation {
    /// Whether the location names a snapshot rather than the working VDI.
    pub fn is_snapshot(&self) -> bool {
        self.snap_id != 0 || !self.tag.is_empty()
    }

    pub fn parse(s: &str) -> DriverResult<Self> {
        if s.contains("://") {
            parse_uri(s)
        } else {
            parse_legacy(s)
        }
    }
}

impl std::str::FromStr for VdiLocation {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split a snapshot reference into (snapid, tag): all digits is an id.
pub fn parse_snapshot_ref(s: &str) -> (u32, String) {
    match s.parse::<u32>() {
        Ok(id) if id != 0 => (id, String::new()),
        _ => (0, s.to_string()),
    }
}

fn invalid(msg: impl Into<String>) -> DriverError {
    DriverError::InvalidLocation(msg.into())
}

fn parse_uri(s: &str) -> DriverResult<VdiLocation> {
    let url = Url::parse(s).map_err(|e| invalid(format!("{}: {}", s, e)))?;

    let is_unix = match url.scheme() {
        "sheepdog" | "sheepdog+tcp" => false,
        "sheepdog+unix" => true,
        other => return Err(invalid(format!("unknown transport '{}'", other))),
    };

    let vdi = url.path().trim_start_matches('/');
    if vdi.is_empty() {
        return Err(invalid("missing VDI name"));
    }

    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let host_str = url.host_str().filter(|h| !h.is_empty());

    let host = if is_unix {
        if host_str.is_some() || url.port().is_some() {
            return Err(invalid("a unix socket location takes no host or port"));
        }
        match query.as_slice() {
            [(key, path)] if key == "socket" && !path.is_empty() => {
                HostSpec::Unix(PathBuf::from(path))
            }
            _ => return Err(invalid("expected exactly one 'socket=path' parameter")),
        }
    } else {
        if !query.is_empty() {
            return Err(invalid("a tcp location takes no query parameters"));
        }
        HostSpec::Tcp {
            host: host_str.unwrap_or(SD_DEFAULT_ADDR).to_string(),
            port: url.port().unwrap_or(SD_LISTEN_PORT),
        }
    };

    let (snap_id, tag) = url.fragment().map(parse_snapshot_ref).unwrap_or_default();
    build(host, vdi, snap_id, tag)
}

fn parse_legacy(s: &str) -> DriverResult<VdiLocation> {
    let s = s.strip_prefix("sheepdog:").unwrap_or(s);
    let parts: Vec<&str> = s.split(':').collect();

    let (host, rest) = if parts.len() >= 3 {
        let port = parts[1]
            .parse::<u16>()
            .map_err(|_| invalid(format!("bad port '{}'", parts[1])))?;
        let host = if parts[0].is_empty() { SD_DEFAULT_ADDR } else { parts[0] };
        (
            HostSpec::Tcp {
                host: host.to_string(),
                port,
            },
            &parts[2..],
        )
    } else {
        (HostSpec::default(), &parts[..])
    };

    let vdi = rest[0];
    if vdi.is_empty() {
        return Err(invalid("missing VDI name"));
    }
    let (snap_id, tag) = match rest.get(1..) {
        Some(snap) if !snap.is_empty() => parse_snapshot_ref(&snap.join(":")),
        _ => (0, String::new()),
    };
    build(host, vdi, snap_id, tag)
}

fn build(host: HostSpec, vdi: &str, snap_id: u32, tag: String) -> DriverResult<VdiLocation> {
    if vdi.len() >= SD_MAX_VDI_LEN {
        return Err(invalid("VDI name too long"));
    }
    if tag.len() >= SD_MAX_VDI_TAG_LEN {
        return Err(invalid("snapshot tag too long"));
    }
    Ok(VdiLocation {
        host,
        vdi: vdi.to_string(),
        snap_id,
        tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(host: &str, port: u16) -> HostSpec {
        HostSpec::Tcp {
            host: host.into(),
            port,
        }
    }

    #[test]
    fn test_uri_defaults() {
        let loc = VdiLocation::parse("sheepdog:///vol0").unwrap();
        assert_eq!(loc.host, tcp("localhost", 7000));
        assert_eq!(loc.vdi, "vol0");
        assert!(!loc.is_snapshot());
    }

    #[test]
    fn test_uri_host_port_and_fragment() {
        let loc = VdiLocation::parse("sheepdog+tcp://10.0.0.5:7001/vol0#3").unwrap();
        assert_eq!(loc.host, tcp("10.0.0.5", 7001));
        assert_eq!(loc.snap_id, 3);
        assert!(loc.tag.is_empty());

        let loc = VdiLocation::parse("sheepdog://node1/vol0#nightly").unwrap();
        assert_eq!(loc.host, tcp("node1", 7000));
        assert_eq!(loc.snap_id, 0);
        assert_eq!(loc.tag, "nightly");
        assert!(loc.is_snapshot());
    }

    #[test]
    fn test_uri_unix() {
        let loc = VdiLocation::parse("sheepdog+unix:///vol0?socket=/var/run/sheep.sock").unwrap();
        assert_eq!(loc.host, HostSpec::Unix(PathBuf::from("/var/run/sheep.sock")));
        assert_eq!(loc.vdi, "vol0");

        assert!(VdiLocation::parse("sheepdog+unix:///vol0").is_err());
        assert!(VdiLocation::parse("sheepdog+unix://host/vol0?socket=/s").is_err());
    }

    #[test]
    fn test_uri_errors() {
        assert!(VdiLocation::parse("nbd://host/vol0").is_err());
        assert!(VdiLocation::parse("sheepdog://host/").is_err());
        assert!(VdiLocation::parse("sheepdog://host/vol0?socket=/s").is_err());
    }

    #[test]
    fn test_legacy_forms() {
        let loc = VdiLocation::parse("vol0").unwrap();
        assert_eq!(loc.host, tcp("localhost", 7000));
        assert_eq!(loc.vdi, "vol0");

        let loc = VdiLocation::parse("vol0:5").unwrap();
        assert_eq!(loc.snap_id, 5);

        let loc = VdiLocation::parse("vol0:golden").unwrap();
        assert_eq!(loc.tag, "golden");

        let loc = VdiLocation::parse("sheepdog:storage1:7002:vol0:2").unwrap();
        assert_eq!(loc.host, tcp("storage1", 7002));
        assert_eq!(loc.vdi, "vol0");
        assert_eq!(loc.snap_id, 2);

        assert!(VdiLocation::parse("host:notaport:vol0").is_err());
        assert!(VdiLocation::parse("").is_err());
    }

    #[test]
    fn test_snapshot_ref() {
        assert_eq!(parse_snapshot_ref("12"), (12, String::new()));
        assert_eq!(parse_snapshot_ref("0"), (0, "0".to_string()));
        assert_eq!(parse_snapshot_ref("v1.2"), (0, "v1.2".to_string()));
    }
}
