use std::collections::HashSet;

/// Destination blacklist: exact IP matches plus domain suffix matches
///
/// Domain entries are stored lowercased; a blocked apex blocks every
/// subdomain below it. Blocking `baidu.com` blocks `map.baidu.com` but not
/// the other way around.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    ips: HashSet<String>,
    domains: HashSet<String>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole state with a new set of entries
    ///
    /// IPs are stored verbatim, domains lowercased.
    pub fn load<I, D>(&mut self, ips: I, domains: D)
    where
        I: IntoIterator<Item = String>,
        D: IntoIterator<Item = String>,
    {
        self.ips = ips.into_iter().collect();
        self.domains = domains
            .into_iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
    }

    #[allow(dead_code)]
    pub fn insert_ip(&mut self, ip: impl Into<String>) {
        self.ips.insert(ip.into());
    }

    #[allow(dead_code)]
    pub fn insert_domain(&mut self, domain: &str) {
        self.domains.insert(domain.to_ascii_lowercase());
    }

    #[allow(dead_code)]
    pub fn clear(&mut self) {
        self.ips.clear();
        self.domains.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.domains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ips.len() + self.domains.len()
    }

    /// Exact membership test against the IP set
    pub fn is_blocked_ip(&self, ip: &str) -> bool {
        if self.ips.is_empty() {
            return false;
        }
        self.ips.contains(ip)
    }

    /// Suffix membership test against the domain set
    ///
    /// Walks successive `.`-separated suffixes of the lowercased host, so a
    /// single apex entry covers all its subdomains.
    pub fn is_blocked_domain(&self, host: &str) -> bool {
        if self.domains.is_empty() {
            return false;
        }

        let normalized = host.to_ascii_lowercase();
        let mut suffix = normalized.as_str();
        loop {
            if self.domains.contains(suffix) {
                return true;
            }
            match suffix.find('.') {
                Some(pos) => suffix = &suffix[pos + 1..],
                None => return false,
            }
        }
    }
}
