//! Host header classification.
//!
//! Hosts are compared case-insensitively with the port and one trailing dot
//! removed. The base domain itself (and any admin alias) is the admin API;
//! exactly one DNS label below it addresses a site. Everything else that
//! parses as a hostname is foreign.

/// Longest hostname accepted.
const MAX_HOST_LEN: usize = 253;
/// Longest single DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Where a request is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostClass {
    Admin,
    /// One label below the base domain. Not yet validated as a site id.
    Site(String),
    /// Well-formed, but not ours.
    Foreign,
    Malformed,
}

fn valid_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Lowercase `raw`, strip the port and one trailing dot, and check it is a
/// syntactically valid hostname. `None` when it is not.
pub fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.is_ascii() {
        return None;
    }
    let lower = raw.to_ascii_lowercase();

    let host = match lower.rsplit_once(':') {
        Some((host, port)) => {
            if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            host
        }
        None => lower.as_str(),
    };
    let host = host.strip_suffix('.').unwrap_or(host);

    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return None;
    }
    if !host.split('.').all(valid_dns_label) {
        return None;
    }
    Some(host.to_string())
}

/// Host matching rules for one deployment of the router.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    base_domain: String,
    admin_aliases: Vec<String>,
}

impl HostMatcher {
    /// Aliases that do not normalize are dropped.
    pub fn new(base_domain: &str, admin_aliases: &[String]) -> Self {
        let base_domain = normalize_host(base_domain)
            .unwrap_or_else(|| base_domain.trim().trim_end_matches('.').to_ascii_lowercase());
        let admin_aliases = admin_aliases
            .iter()
            .filter_map(|alias| normalize_host(alias))
            .collect();
        Self {
            base_domain,
            admin_aliases,
        }
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    pub fn classify(&self, raw: Option<&str>) -> HostClass {
        let Some(host) = raw.and_then(normalize_host) else {
            return HostClass::Malformed;
        };
        if host == self.base_domain || self.admin_aliases.iter().any(|a| *a == host) {
            return HostClass::Admin;
        }
        match host
            .strip_suffix(self.base_domain.as_str())
            .and_then(|prefix| prefix.strip_suffix('.'))
        {
            Some(label) if !label.contains('.') => HostClass::Site(label.to_string()),
            _ => HostClass::Foreign,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> HostMatcher {
        HostMatcher::new("Cloud.Example.com.", &["admin.internal".to_string()])
    }

    #[test]
    fn normalizes_case_port_and_trailing_dot() {
        assert_eq!(normalize_host("Blog.Example.COM"), Some("blog.example.com".into()));
        assert_eq!(normalize_host("blog.example.com:8443"), Some("blog.example.com".into()));
        assert_eq!(normalize_host("blog.example.com."), Some("blog.example.com".into()));
        assert_eq!(normalize_host("blog.example.com.:80"), Some("blog.example.com".into()));
    }

    #[test]
    fn rejects_malformed_hosts() {
        for raw in [
            "",
            "   ",
            "blög.example.com",
            "blog..example.com",
            ".example.com",
            "blog_site.example.com",
            "blog.example.com:",
            "blog.example.com:http",
            "blog.example.com..",
            "bad host",
        ] {
            assert_eq!(normalize_host(raw), None, "{raw:?}");
        }
        assert_eq!(normalize_host(&"a".repeat(64)), None);
    }

    #[test]
    fn classifies_admin_site_and_foreign() {
        let m = matcher();
        assert_eq!(m.base_domain(), "cloud.example.com");
        assert_eq!(m.classify(Some("cloud.example.com")), HostClass::Admin);
        assert_eq!(m.classify(Some("CLOUD.example.com:8080")), HostClass::Admin);
        assert_eq!(m.classify(Some("admin.internal")), HostClass::Admin);
        assert_eq!(
            m.classify(Some("Blog.Cloud.Example.com.")),
            HostClass::Site("blog".into())
        );
        assert_eq!(m.classify(Some("a.b.cloud.example.com")), HostClass::Foreign);
        assert_eq!(m.classify(Some("example.org")), HostClass::Foreign);
        assert_eq!(m.classify(Some("evilcloud.example.com")), HostClass::Foreign);
        assert_eq!(m.classify(None), HostClass::Malformed);
        assert_eq!(m.classify(Some("x..cloud.example.com")), HostClass::Malformed);
    }
}
