use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Rack assigned when resolution fails or no mapping is configured.
pub const DEFAULT_RACK: &str = "/default-rack";

/// Maps a datanode's hostname/IP to a topology location string.
pub trait DnsToSwitch: Send + Sync {
    fn resolve(&self, hostname: &str, ip: &str) -> Option<String>;
}

/// Fixed table resolver fed from configuration.
#[derive(Debug, Default)]
pub struct StaticTableResolver {
    by_host: HashMap<String, String>,
}

impl StaticTableResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mapping(mut self, host_or_ip: impl Into<String>, rack: impl Into<String>) -> Self {
        self.by_host.insert(host_or_ip.into(), rack.into());
        self
    }
}

impl DnsToSwitch for StaticTableResolver {
    fn resolve(&self, hostname: &str, ip: &str) -> Option<String> {
        self.by_host
            .get(hostname)
            .or_else(|| self.by_host.get(ip))
            .cloned()
    }
}

/// Caches resolutions so repeated registrations of the same address never
/// re-query the inner resolver. Falls back to [`DEFAULT_RACK`] on miss.
pub struct CachingResolver {
    inner: Arc<dyn DnsToSwitch>,
    cache: Mutex<HashMap<String, String>>,
}

impl CachingResolver {
    pub fn new(inner: Arc<dyn DnsToSwitch>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn location_of(&self, hostname: &str, ip: &str) -> String {
        let cache_key = format!("{hostname}|{ip}");
        if let Some(found) = self.cache.lock().get(&cache_key) {
            return found.clone();
        }
        let resolved = match self.inner.resolve(hostname, ip) {
            Some(rack) => rack,
            None => {
                warn!(
                    "event=topology_resolve_miss host={hostname} ip={ip} fallback={DEFAULT_RACK}"
                );
                DEFAULT_RACK.to_string()
            }
        };
        self.cache.lock().insert(cache_key, resolved.clone());
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl DnsToSwitch for CountingResolver {
        fn resolve(&self, hostname: &str, _ip: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if hostname == "known" {
                Some("/rack-a".to_string())
            } else {
                None
            }
        }
    }

    #[test]
    fn cache_prevents_repeat_resolution() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let resolver = CachingResolver::new(inner.clone());
        assert_eq!(resolver.location_of("known", "10.0.0.1"), "/rack-a");
        assert_eq!(resolver.location_of("known", "10.0.0.1"), "/rack-a");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unresolvable_host_lands_in_default_rack() {
        let resolver = CachingResolver::new(Arc::new(StaticTableResolver::new()));
        assert_eq!(resolver.location_of("mystery", "10.0.0.9"), DEFAULT_RACK);
    }

    #[test]
    fn static_table_matches_ip_after_host() {
        let table = StaticTableResolver::new()
            .with_mapping("10.0.0.7", "/rack-b")
            .with_mapping("db-1", "/rack-c");
        assert_eq!(table.resolve("db-1", "10.0.0.7"), Some("/rack-c".into()));
        assert_eq!(table.resolve("other", "10.0.0.7"), Some("/rack-b".into()));
    }
}
