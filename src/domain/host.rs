//! Placement strings
//!
//! Volumes are placed on `host@backend#pool`. The backend and pool parts are
//! optional; a missing pool can be replaced by [`DEFAULT_POOL_NAME`].

/// Pool name used when a backend does not report pools
pub const DEFAULT_POOL_NAME: &str = "_pool0";

/// Which part of a placement string to extract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLevel {
    /// `host`
    Host,
    /// `host@backend`
    Backend,
    /// `pool`
    Pool,
}

/// Extract one level from a placement string.
///
/// For [`HostLevel::Pool`] a missing pool yields `None`, or
/// [`DEFAULT_POOL_NAME`] when `default_pool` is set.
pub fn extract_host(host: &str, level: HostLevel, default_pool: bool) -> Option<String> {
    match level {
        HostLevel::Host => {
            let backend = host.split('#').next().unwrap_or(host);
            Some(backend.split('@').next().unwrap_or(backend).to_string())
        }
        HostLevel::Backend => Some(host.split('#').next().unwrap_or(host).to_string()),
        HostLevel::Pool => match host.split_once('#') {
            Some((_, pool)) => Some(pool.to_string()),
            None if default_pool => Some(DEFAULT_POOL_NAME.to_string()),
            None => None,
        },
    }
}

/// Append a pool to a placement string that has none
pub fn append_pool(host: &str, pool: Option<&str>) -> String {
    match pool {
        Some(pool) if !host.contains('#') => format!("{}#{}", host, pool),
        _ => host.to_string(),
    }
}

/// Whether two placement strings refer to the same backend
pub fn same_backend(a: &str, b: &str) -> bool {
    extract_host(a, HostLevel::Backend, false) == extract_host(b, HostLevel::Backend, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_levels() {
        let host = "node1@lvm#fast";
        assert_eq!(extract_host(host, HostLevel::Host, false).as_deref(), Some("node1"));
        assert_eq!(
            extract_host(host, HostLevel::Backend, false).as_deref(),
            Some("node1@lvm")
        );
        assert_eq!(extract_host(host, HostLevel::Pool, false).as_deref(), Some("fast"));
    }

    #[test]
    fn test_default_pool() {
        assert_eq!(extract_host("node1@lvm", HostLevel::Pool, false), None);
        assert_eq!(
            extract_host("node1@lvm", HostLevel::Pool, true).as_deref(),
            Some("_pool0")
        );
    }

    #[test]
    fn test_append_pool() {
        assert_eq!(append_pool("node1@lvm", Some("p1")), "node1@lvm#p1");
        assert_eq!(append_pool("node1@lvm#p0", Some("p1")), "node1@lvm#p0");
        assert_eq!(append_pool("node1@lvm", None), "node1@lvm");
        assert!(same_backend("node1@lvm#a", "node1@lvm#b"));
        assert!(!same_backend("node1@lvm#a", "node1@ceph#a"));
    }
}
