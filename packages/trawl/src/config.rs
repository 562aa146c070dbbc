//! Engine configuration: network facilities, failure policy and per-module
//! options.
//!
//! [`TrawlConfig::from_env`] reads a `.env` file if present, then the
//! `TRAWL_*` variables:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `TRAWL_DNS_SERVER` | resolver for modules, `ip` or `ip:port` |
//! | `TRAWL_PROXY` | proxy URL (`socks5://`, `http://`, ...) |
//! | `TRAWL_USER_AGENT` | user agent for outbound requests |
//! | `TRAWL_FETCH_TIMEOUT_SECS` | per-request timeout handed to modules |
//! | `TRAWL_HANDLER_TIMEOUT_SECS` | bound on one module call, `0` disables |
//! | `TRAWL_FAILURE_POLICY` | `abort` or `isolate` |
//! | `TRAWL_MODULE_OPTIONS` | JSON object of per-module options |
//!
//! A scan request may override any of these through [`ConfigOverrides`].

use std::collections::BTreeMap;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ScanError;
use crate::module::ModuleOptions;

/// Default DNS port when the override names only an address.
const DNS_PORT: u16 = 53;

/// Default per-request timeout handed to modules.
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Proxy schemes modules know how to speak.
const PROXY_SCHEMES: &[&str] = &["socks4", "socks5", "socks5h", "http", "https"];

/// Option keys under which network settings are handed to every module.
pub const OPT_DNS_SERVER: &str = "_dnsserver";
pub const OPT_PROXY: &str = "_proxy";
pub const OPT_USER_AGENT: &str = "_useragent";
pub const OPT_FETCH_TIMEOUT: &str = "_fetchtimeout";

/// Process-wide network facilities, owned by the controller and handed to
/// modules read-only for the lifetime of one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Resolver to use instead of the system one.
    pub dns_server: Option<SocketAddr>,
    /// Upstream proxy for module traffic.
    pub proxy: Option<Url>,
    pub user_agent: String,
    pub fetch_timeout: Duration,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            dns_server: None,
            proxy: None,
            user_agent: concat!("trawl/", env!("CARGO_PKG_VERSION")).to_string(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

impl NetworkSettings {
    /// The `_`-prefixed options merged into every module's configuration.
    pub fn as_options(&self) -> ModuleOptions {
        let mut options = ModuleOptions::new();
        if let Some(dns) = self.dns_server {
            options.set(OPT_DNS_SERVER, dns.to_string());
        }
        if let Some(proxy) = &self.proxy {
            options.set(OPT_PROXY, proxy.as_str());
        }
        options.set(OPT_USER_AGENT, self.user_agent.as_str());
        options.set(OPT_FETCH_TIMEOUT, self.fetch_timeout.as_secs());
        options
    }
}

/// What the bus does when a module call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The error ends the scan as `ERROR-FAILED`.
    #[default]
    Abort,
    /// The module is put into error state and receives nothing further;
    /// the scan carries on.
    Isolate,
}

/// Global configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrawlConfig {
    pub network: NetworkSettings,
    pub failure_policy: FailurePolicy,
    /// Hard cap on a single `handle_event`/`start` call. `None` keeps
    /// cancellation purely cooperative.
    pub handler_timeout: Option<Duration>,
    /// Per-module option values, keyed by module name.
    pub module_options: BTreeMap<String, ModuleOptions>,
}

impl TrawlConfig {
    /// Load configuration from `TRAWL_*` environment variables.
    ///
    /// A `.env` file is read first when present.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup; unset keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = TrawlConfig::default();

        if let Some(dns) = lookup("TRAWL_DNS_SERVER") {
            config.network.dns_server =
                Some(parse_dns_server(&dns).context("TRAWL_DNS_SERVER must be ip or ip:port")?);
        }
        if let Some(proxy) = lookup("TRAWL_PROXY") {
            config.network.proxy =
                Some(parse_proxy(&proxy).context("TRAWL_PROXY must be a proxy URL")?);
        }
        if let Some(agent) = lookup("TRAWL_USER_AGENT") {
            config.network.user_agent = agent;
        }
        if let Some(secs) = lookup("TRAWL_FETCH_TIMEOUT_SECS") {
            config.network.fetch_timeout = Duration::from_secs(
                secs.parse()
                    .context("TRAWL_FETCH_TIMEOUT_SECS must be a valid number")?,
            );
        }
        if let Some(secs) = lookup("TRAWL_HANDLER_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .context("TRAWL_HANDLER_TIMEOUT_SECS must be a valid number")?;
            config.handler_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(policy) = lookup("TRAWL_FAILURE_POLICY") {
            config.failure_policy = match policy.to_ascii_lowercase().as_str() {
                "abort" => FailurePolicy::Abort,
                "isolate" => FailurePolicy::Isolate,
                other => {
                    return Err(anyhow!(
                        "TRAWL_FAILURE_POLICY must be abort or isolate, got {other}"
                    ));
                }
            };
        }
        if let Some(json) = lookup("TRAWL_MODULE_OPTIONS") {
            config.module_options = serde_json::from_str(&json)
                .context("TRAWL_MODULE_OPTIONS must be a JSON object of module options")?;
        }

        Ok(config)
    }

    /// Layer per-scan overrides on top of this configuration.
    pub fn with_overrides(&self, overrides: &ConfigOverrides) -> Result<Self, ScanError> {
        let mut merged = self.clone();

        if let Some(dns) = &overrides.dns_server {
            merged.network.dns_server = Some(
                parse_dns_server(dns).map_err(|e| ScanError::Config(format!("dns_server: {e}")))?,
            );
        }
        if let Some(proxy) = &overrides.proxy {
            merged.network.proxy =
                Some(parse_proxy(proxy).map_err(|e| ScanError::Config(format!("proxy: {e}")))?);
        }
        if let Some(agent) = &overrides.user_agent {
            merged.network.user_agent = agent.clone();
        }
        if let Some(secs) = overrides.fetch_timeout_secs {
            merged.network.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.handler_timeout_secs {
            merged.handler_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(policy) = overrides.failure_policy {
            merged.failure_policy = policy;
        }
        for (module, options) in &overrides.module_options {
            merged
                .module_options
                .entry(module.clone())
                .or_default()
                .merge(options);
        }

        Ok(merged)
    }

    /// Options for one module: network options, then the module's own
    /// defaults, then configured values. Later layers win.
    pub fn options_for(&self, module: &str, defaults: &ModuleOptions) -> ModuleOptions {
        let mut options = self.network.as_options();
        options.merge(defaults);
        if let Some(configured) = self.module_options.get(module) {
            options.merge(configured);
        }
        options
    }
}

/// Per-scan configuration overrides, usually deserialised from a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub dns_server: Option<String>,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub fetch_timeout_secs: Option<u64>,
    /// `0` disables the handler timeout.
    pub handler_timeout_secs: Option<u64>,
    pub failure_policy: Option<FailurePolicy>,
    pub module_options: BTreeMap<String, ModuleOptions>,
}

fn parse_dns_server(raw: &str) -> Result<SocketAddr> {
    let raw = raw.trim();
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = raw
        .parse()
        .with_context(|| format!("{raw} is not an IP address"))?;
    Ok(SocketAddr::new(ip, DNS_PORT))
}

fn parse_proxy(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("{raw} is not a URL"))?;
    if !PROXY_SCHEMES.contains(&url.scheme()) {
        return Err(anyhow!("unsupported proxy scheme {}", url.scheme()));
    }
    if url.host_str().is_none() {
        return Err(anyhow!("proxy URL {raw} has no host"));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = TrawlConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, TrawlConfig::default());
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert!(config.handler_timeout.is_none());
        assert!(config.network.user_agent.starts_with("trawl/"));
    }

    #[test]
    fn test_reads_all_keys() {
        let config = TrawlConfig::from_lookup(lookup(&[
            ("TRAWL_DNS_SERVER", "1.1.1.1"),
            ("TRAWL_PROXY", "socks5://127.0.0.1:9050"),
            ("TRAWL_USER_AGENT", "probe/1.0"),
            ("TRAWL_FETCH_TIMEOUT_SECS", "12"),
            ("TRAWL_HANDLER_TIMEOUT_SECS", "300"),
            ("TRAWL_FAILURE_POLICY", "Isolate"),
            ("TRAWL_MODULE_OPTIONS", r#"{"sfp_portscan": {"ports": "22,80,443"}}"#),
        ]))
        .unwrap();

        assert_eq!(
            config.network.dns_server,
            Some("1.1.1.1:53".parse().unwrap())
        );
        assert_eq!(config.network.proxy.as_ref().unwrap().scheme(), "socks5");
        assert_eq!(config.network.user_agent, "probe/1.0");
        assert_eq!(config.network.fetch_timeout, Duration::from_secs(12));
        assert_eq!(config.handler_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.failure_policy, FailurePolicy::Isolate);
        assert_eq!(
            config.module_options["sfp_portscan"].get_str("ports"),
            Some("22,80,443")
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(TrawlConfig::from_lookup(lookup(&[("TRAWL_DNS_SERVER", "dns.google")])).is_err());
        assert!(TrawlConfig::from_lookup(lookup(&[("TRAWL_PROXY", "ftp://proxy:21")])).is_err());
        assert!(
            TrawlConfig::from_lookup(lookup(&[("TRAWL_FETCH_TIMEOUT_SECS", "soon")])).is_err()
        );
        assert!(TrawlConfig::from_lookup(lookup(&[("TRAWL_FAILURE_POLICY", "retry")])).is_err());
        assert!(TrawlConfig::from_lookup(lookup(&[("TRAWL_MODULE_OPTIONS", "[1,2]")])).is_err());
    }

    #[test]
    fn test_overrides_win() {
        let base = TrawlConfig::from_lookup(lookup(&[
            ("TRAWL_USER_AGENT", "base"),
            ("TRAWL_HANDLER_TIMEOUT_SECS", "60"),
            ("TRAWL_MODULE_OPTIONS", r#"{"m": {"a": 1, "b": 2}}"#),
        ]))
        .unwrap();

        let overrides: ConfigOverrides = serde_json::from_str(
            r#"{
                "user_agent": "override",
                "dns_server": "9.9.9.9:5353",
                "handler_timeout_secs": 0,
                "module_options": {"m": {"b": 3}}
            }"#,
        )
        .unwrap();

        let merged = base.with_overrides(&overrides).unwrap();
        assert_eq!(merged.network.user_agent, "override");
        assert_eq!(
            merged.network.dns_server,
            Some("9.9.9.9:5353".parse().unwrap())
        );
        assert!(merged.handler_timeout.is_none());
        assert_eq!(merged.module_options["m"].get_u64("a"), Some(1));
        assert_eq!(merged.module_options["m"].get_u64("b"), Some(3));
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let overrides = ConfigOverrides {
            proxy: Some("not a url".into()),
            ..Default::default()
        };
        match TrawlConfig::default().with_overrides(&overrides) {
            Err(ScanError::Config(msg)) => assert!(msg.contains("proxy")),
            other => panic!("Expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn test_options_layering() {
        let mut config = TrawlConfig::default();
        config.network.proxy = Some(Url::parse("http://10.0.0.1:3128").unwrap());
        config
            .module_options
            .entry("sfp_spider".into())
            .or_default()
            .set("maxpages", 50);

        let mut defaults = ModuleOptions::new();
        defaults.set("maxpages", 100);
        defaults.set("maxlevels", 3);

        let options = config.options_for("sfp_spider", &defaults);
        assert_eq!(options.get_u64("maxpages"), Some(50));
        assert_eq!(options.get_u64("maxlevels"), Some(3));
        assert_eq!(options.get_str(OPT_PROXY), Some("http://10.0.0.1:3128/"));
        assert_eq!(options.get_u64(OPT_FETCH_TIMEOUT), Some(5));
        assert!(options.get_str(OPT_DNS_SERVER).is_none());
    }
}
