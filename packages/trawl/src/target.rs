//! Seed targets and target-type detection.
//!
//! The user hands the controller a bare string. Its shape decides the type of
//! the first typed event published under ROOT, which is what lets modules
//! that only care about, say, `IP_ADDRESS` react to an IP seed.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::event::EventType;

/// Second-level suffixes under which a three-label name is still registrable.
const SECOND_LEVEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "com.au", "net.au", "org.au", "co.nz", "co.jp",
    "co.za", "com.br", "com.cn", "com.mx", "co.in", "co.kr",
];

/// What kind of thing a seed target is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    IpAddress,
    Ipv6Address,
    Netblock,
    InternetName,
    EmailAddress,
    PhoneNumber,
    HumanName,
    Username,
    BgpAs,
}

impl TargetKind {
    /// Event type of the seed event for a target of this kind.
    pub fn event_type(&self) -> EventType {
        match self {
            TargetKind::IpAddress => EventType::IP_ADDRESS,
            TargetKind::Ipv6Address => EventType::IPV6_ADDRESS,
            TargetKind::Netblock => EventType::NETBLOCK_OWNER,
            TargetKind::InternetName => EventType::INTERNET_NAME,
            TargetKind::EmailAddress => EventType::EMAILADDR,
            TargetKind::PhoneNumber => EventType::PHONE_NUMBER,
            TargetKind::HumanName => EventType::HUMAN_NAME,
            TargetKind::Username => EventType::USERNAME,
            TargetKind::BgpAs => EventType::BGP_AS_OWNER,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type().as_str())
    }
}

/// A parsed, normalised seed target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    value: String,
    kind: TargetKind,
}

impl Target {
    /// Detect the target type and normalise the value.
    ///
    /// Quoted strings are names: `"Jane Doe"` is a human name, `"jdoe"` (no
    /// space) a username. Numbers are AS numbers, `+` prefixed digits phone
    /// numbers. Names and email addresses are lowercased.
    pub fn parse(input: &str) -> Result<Self, ScanError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(ScanError::InvalidTarget("target is empty".into()));
        }

        if let Some(inner) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            let inner = inner.trim();
            if inner.is_empty() {
                return Err(ScanError::InvalidTarget("quoted target is empty".into()));
            }
            let kind = if inner.contains(' ') {
                TargetKind::HumanName
            } else {
                TargetKind::Username
            };
            return Ok(Self::new(inner.to_string(), kind));
        }

        if raw.parse::<Ipv4Addr>().is_ok() {
            return Ok(Self::new(raw.to_string(), TargetKind::IpAddress));
        }
        if raw.parse::<Ipv6Addr>().is_ok() {
            return Ok(Self::new(raw.to_lowercase(), TargetKind::Ipv6Address));
        }
        if is_netblock(raw) {
            return Ok(Self::new(raw.to_string(), TargetKind::Netblock));
        }
        if raw.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Self::new(raw.to_string(), TargetKind::BgpAs));
        }
        if let Some(digits) = raw.strip_prefix('+') {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit() || c == ' ') {
                return Ok(Self::new(raw.replace(' ', ""), TargetKind::PhoneNumber));
            }
        }
        if let Some((local, domain)) = raw.split_once('@') {
            if !local.is_empty() && is_hostname(domain) {
                return Ok(Self::new(raw.to_lowercase(), TargetKind::EmailAddress));
            }
        }
        if is_hostname(raw) {
            return Ok(Self::new(
                raw.trim_end_matches('.').to_lowercase(),
                TargetKind::InternetName,
            ));
        }

        Err(ScanError::InvalidTarget(format!(
            "could not determine target type of {raw}"
        )))
    }

    fn new(value: String, kind: TargetKind) -> Self {
        Self { value, kind }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// True when an `INTERNET_NAME` target is itself a registrable domain
    /// (`example.com`, `example.co.uk`) rather than a host under one.
    pub fn is_registrable_domain(&self) -> bool {
        if self.kind != TargetKind::InternetName {
            return false;
        }
        let labels = self.value.split('.').count();
        match labels {
            2 => true,
            3 => SECOND_LEVEL_SUFFIXES
                .iter()
                .any(|suffix| self.value.ends_with(&format!(".{suffix}"))),
            _ => false,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

fn is_netblock(raw: &str) -> bool {
    let Some((addr, prefix)) = raw.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => prefix <= 32,
        Ok(IpAddr::V6(_)) => prefix <= 128,
        Err(_) => false,
    }
}

fn is_hostname(raw: &str) -> bool {
    let name = raw.trim_end_matches('.');
    if name.len() > 253 || !name.contains('.') {
        return false;
    }
    let labels: Vec<&str> = name.split('.').collect();
    let tld_ok = labels
        .last()
        .map(|tld| tld.chars().any(|c| c.is_ascii_alphabetic()))
        .unwrap_or(false);

    tld_ok
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}
