//! Event records: the facts modules discover.
//!
//! # Overview
//!
//! A [`ScanEvent`] is a typed piece of data plus a link to the event that
//! caused it. Every event except ROOT has exactly one parent, so the events
//! of one scan form a tree rooted at the target:
//!
//! ```text
//! ROOT (example.com)
//!  └─ INTERNET_NAME example.com            [controller]
//!      ├─ IP_ADDRESS 93.184.216.34         [sfp_dnsresolve]
//!      │   └─ NETBLOCK_OWNER 93.184.216.0/24  [sfp_whois]
//!      └─ DOMAIN_NAME example.com          [sfp_dnsresolve]
//! ```
//!
//! Scores are adjustable with the builder methods while the creating module
//! still owns the event. Once published the bus shares it as
//! `Arc<ScanEvent>`, which has no mutators.
//!
//! # Identity
//!
//! Each event gets a hex SHA-256 identity over its type, timestamp, module and
//! a random salt, so two identical facts still get distinct identities. ROOT
//! always has the reserved identity [`ROOT_HASH`].

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::scan::ScanId;

/// Reserved identity of the ROOT event, and the source hash stored for it.
pub const ROOT_HASH: &str = "ROOT";

/// Maximum value of the confidence, visibility and risk scores.
pub const MAX_SCORE: u8 = 100;

// =============================================================================
// Event Type
// =============================================================================

/// A tag from the event vocabulary, e.g. `IP_ADDRESS`.
///
/// The well-known tags are associated constants. Third-party modules may use
/// tags outside that list; [`EventType::is_known`] tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(Cow<'static, str>);

macro_rules! vocabulary {
    ($($name:ident),* $(,)?) => {
        impl EventType {
            $(
                #[allow(missing_docs)]
                pub const $name: EventType = EventType(Cow::Borrowed(stringify!($name)));
            )*

            /// Every tag in the built-in vocabulary.
            pub const KNOWN: &'static [EventType] = &[$(EventType::$name),*];
        }
    };
}

vocabulary!(
    ROOT,
    INTERNET_NAME,
    INTERNET_NAME_UNRESOLVED,
    DOMAIN_NAME,
    AFFILIATE_INTERNET_NAME,
    CO_HOSTED_SITE,
    IP_ADDRESS,
    IPV6_ADDRESS,
    AFFILIATE_IPADDR,
    NETBLOCK_OWNER,
    NETBLOCK_MEMBER,
    BGP_AS_OWNER,
    BGP_AS_MEMBER,
    EMAILADDR,
    PHONE_NUMBER,
    HUMAN_NAME,
    USERNAME,
    DNS_TEXT,
    DNS_SPF,
    TCP_PORT_OPEN,
    TCP_PORT_OPEN_BANNER,
    WEBSERVER_BANNER,
    WEBSERVER_HTTPHEADERS,
    LINKED_URL_INTERNAL,
    LINKED_URL_EXTERNAL,
    TARGET_WEB_CONTENT,
    SEARCH_ENGINE_WEB_CONTENT,
    SSL_CERTIFICATE_RAW,
    SSL_CERTIFICATE_ISSUED,
    SSL_CERTIFICATE_EXPIRED,
    MALICIOUS_IPADDR,
    MALICIOUS_INTERNET_NAME,
    BLACKLISTED_IPADDR,
    BLACKLISTED_INTERNET_NAME,
    RAW_RIR_DATA,
    RAW_DNS_RECORDS,
    RAW_FILE_META_DATA,
    GEOINFO,
    PROVIDER_DNS,
    PROVIDER_MAIL,
);

impl EventType {
    /// Create a tag, known or not.
    pub fn new(tag: impl Into<Cow<'static, str>>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the tag belongs to the built-in vocabulary.
    pub fn is_known(&self) -> bool {
        Self::KNOWN.iter().any(|known| known == self)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for EventType {
    fn from(tag: &'static str) -> Self {
        Self(Cow::Borrowed(tag))
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        Self(Cow::Owned(tag))
    }
}

// =============================================================================
// Scan Event
// =============================================================================

/// A discovered fact with its provenance link.
pub struct ScanEvent {
    event_type: EventType,
    data: String,
    module: String,
    generated_at: DateTime<Utc>,
    confidence: u8,
    visibility: u8,
    risk: u8,
    source: Option<Arc<ScanEvent>>,
    hash: String,
}

impl ScanEvent {
    /// Create an event caused by `parent`.
    ///
    /// Defaults: confidence 100, visibility 100, risk 0.
    pub fn new(
        event_type: impl Into<EventType>,
        data: impl Into<String>,
        module: impl Into<String>,
        parent: &Arc<ScanEvent>,
    ) -> Self {
        let event_type = event_type.into();
        let module = module.into();
        let generated_at = Utc::now();
        let hash = identity_hash(&event_type, &generated_at, &module);

        Self {
            event_type,
            data: data.into(),
            module,
            generated_at,
            confidence: MAX_SCORE,
            visibility: MAX_SCORE,
            risk: 0,
            source: Some(Arc::clone(parent)),
            hash,
        }
    }

    /// The ROOT event for a target. Its identity is always [`ROOT_HASH`].
    pub fn root(target: impl Into<String>) -> Self {
        Self {
            event_type: EventType::ROOT,
            data: target.into(),
            module: String::new(),
            generated_at: Utc::now(),
            confidence: MAX_SCORE,
            visibility: MAX_SCORE,
            risk: 0,
            source: None,
            hash: ROOT_HASH.to_string(),
        }
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.set_confidence(confidence);
        self
    }

    pub fn with_visibility(mut self, visibility: u8) -> Self {
        self.set_visibility(visibility);
        self
    }

    pub fn with_risk(mut self, risk: u8) -> Self {
        self.set_risk(risk);
        self
    }

    pub fn set_confidence(&mut self, confidence: u8) {
        self.confidence = confidence.min(MAX_SCORE);
    }

    pub fn set_visibility(&mut self, visibility: u8) {
        self.visibility = visibility.min(MAX_SCORE);
    }

    pub fn set_risk(&mut self, risk: u8) {
        self.risk = risk.min(MAX_SCORE);
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn confidence(&self) -> u8 {
        self.confidence
    }

    pub fn visibility(&self) -> u8 {
        self.visibility
    }

    pub fn risk(&self) -> u8 {
        self.risk
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The parent event, `None` only for ROOT.
    pub fn source(&self) -> Option<&Arc<ScanEvent>> {
        self.source.as_ref()
    }

    /// Identity of the parent; ROOT reports [`ROOT_HASH`].
    pub fn source_hash(&self) -> &str {
        self.source
            .as_ref()
            .map(|parent| parent.hash())
            .unwrap_or(ROOT_HASH)
    }

    pub fn is_root(&self) -> bool {
        self.source.is_none()
    }

    /// Walk the parent chain upwards, nearest ancestor first.
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors {
            next: self.source.as_ref(),
        }
    }

    /// Number of links between this event and ROOT.
    pub fn depth(&self) -> usize {
        self.ancestors().count()
    }

    /// Same type and same data, ignoring case.
    pub fn same_fact(&self, other: &ScanEvent) -> bool {
        self.event_type == other.event_type && eq_ignore_case(&self.data, &other.data)
    }
}

impl Drop for ScanEvent {
    // Unlink the parent chain iteratively so dropping a deep provenance chain
    // does not recurse once per ancestor.
    fn drop(&mut self) {
        let mut next = self.source.take();
        while let Some(parent) = next {
            match Arc::try_unwrap(parent) {
                Ok(mut event) => next = event.source.take(),
                Err(_) => break,
            }
        }
    }
}

impl fmt::Debug for ScanEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanEvent")
            .field("event_type", &self.event_type)
            .field("data", &self.data)
            .field("module", &self.module)
            .field("hash", &self.hash)
            .field("source_hash", &self.source_hash())
            .finish_non_exhaustive()
    }
}

/// Iterator over an event's ancestors.
pub struct Ancestors<'a> {
    next: Option<&'a Arc<ScanEvent>>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Arc<ScanEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.source.as_ref();
        Some(current)
    }
}

fn identity_hash(event_type: &EventType, generated_at: &DateTime<Utc>, module: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(generated_at.to_rfc3339().as_bytes());
    hasher.update(module.as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize())
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

// =============================================================================
// Stored Event
// =============================================================================

/// The record shape the persistence collaborator stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub scan_id: ScanId,
    pub hash: String,
    pub event_type: EventType,
    pub generated_at: DateTime<Utc>,
    pub confidence: u8,
    pub visibility: u8,
    pub risk: u8,
    pub module: String,
    pub data: String,
    /// Parent identity; [`ROOT_HASH`] for the ROOT event.
    pub source_hash: String,
}

impl StoredEvent {
    pub fn from_event(scan_id: ScanId, event: &ScanEvent) -> Self {
        Self {
            scan_id,
            hash: event.hash().to_string(),
            event_type: event.event_type().clone(),
            generated_at: event.generated_at(),
            confidence: event.confidence(),
            visibility: event.visibility(),
            risk: event.risk(),
            module: event.module().to_string(),
            data: event.data().to_string(),
            source_hash: event.source_hash().to_string(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.hash == ROOT_HASH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Arc<ScanEvent> {
        Arc::new(ScanEvent::root("example.com"))
    }

    #[test]
    fn test_root_identity() {
        let root = ScanEvent::root("example.com");
        assert_eq!(root.hash(), ROOT_HASH);
        assert_eq!(root.source_hash(), ROOT_HASH);
        assert_eq!(root.event_type(), &EventType::ROOT);
        assert!(root.is_root());
        assert_eq!(root.depth(), 0);
    }

    #[test]
    fn test_child_links_to_parent() {
        let root = root();
        let child = ScanEvent::new(EventType::INTERNET_NAME, "example.com", "controller", &root);

        assert_eq!(child.source_hash(), ROOT_HASH);
        assert!(!child.is_root());
        assert_eq!(child.depth(), 1);
        assert_eq!(child.hash().len(), 64);
        assert_ne!(child.hash(), ROOT_HASH);
    }

    #[test]
    fn test_identical_facts_get_distinct_hashes() {
        let root = root();
        let a = ScanEvent::new(EventType::IP_ADDRESS, "10.0.0.1", "m", &root);
        let b = ScanEvent::new(EventType::IP_ADDRESS, "10.0.0.1", "m", &root);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_default_and_clamped_scores() {
        let root = root();
        let event = ScanEvent::new(EventType::IP_ADDRESS, "10.0.0.1", "m", &root);
        assert_eq!(event.confidence(), 100);
        assert_eq!(event.visibility(), 100);
        assert_eq!(event.risk(), 0);

        let event = event.with_confidence(250).with_visibility(40).with_risk(101);
        assert_eq!(event.confidence(), 100);
        assert_eq!(event.visibility(), 40);
        assert_eq!(event.risk(), 100);
    }

    #[test]
    fn test_ancestors_walk_to_root() {
        let root = root();
        let a = Arc::new(ScanEvent::new(EventType::INTERNET_NAME, "example.com", "c", &root));
        let b = Arc::new(ScanEvent::new(EventType::IP_ADDRESS, "93.184.216.34", "dns", &a));
        let c = ScanEvent::new(EventType::NETBLOCK_OWNER, "93.184.216.0/24", "whois", &b);

        let chain: Vec<&str> = c.ancestors().map(|e| e.hash()).collect();
        assert_eq!(chain, vec![b.hash(), a.hash(), ROOT_HASH]);
        assert_eq!(c.depth(), 3);
    }

    #[test]
    fn test_same_fact_ignores_case() {
        let root = root();
        let a = ScanEvent::new(EventType::INTERNET_NAME, "WWW.Example.com", "a", &root);
        let b = ScanEvent::new(EventType::INTERNET_NAME, "www.example.COM", "b", &root);
        let c = ScanEvent::new(EventType::DOMAIN_NAME, "www.example.com", "b", &root);
        assert!(a.same_fact(&b));
        assert!(!a.same_fact(&c));
    }

    #[test]
    fn test_vocabulary() {
        assert!(EventType::IP_ADDRESS.is_known());
        assert!(!EventType::new("CUSTOM_THING").is_known());
        assert_eq!(EventType::from("IP_ADDRESS"), EventType::IP_ADDRESS);
        assert_eq!(
            serde_json::to_string(&EventType::DOMAIN_NAME).unwrap(),
            "\"DOMAIN_NAME\""
        );
    }

    #[test]
    fn test_stored_record_shape() {
        let root = root();
        let child = ScanEvent::new(EventType::IP_ADDRESS, "10.0.0.1", "dns", &root).with_risk(20);
        let scan_id = ScanId::new();

        let stored = StoredEvent::from_event(scan_id, &child);
        assert_eq!(stored.scan_id, scan_id);
        assert_eq!(stored.hash, child.hash());
        assert_eq!(stored.source_hash, ROOT_HASH);
        assert_eq!(stored.module, "dns");
        assert_eq!(stored.risk, 20);
        assert!(!stored.is_root());
        assert!(StoredEvent::from_event(scan_id, &root).is_root());
    }

    #[test]
    fn test_deep_chain_drops_without_recursion() {
        let mut current = root();
        for i in 0..200_000 {
            current = Arc::new(ScanEvent::new(
                EventType::LINKED_URL_INTERNAL,
                format!("https://example.com/{i}"),
                "spider",
                &current,
            ));
        }
        assert_eq!(current.depth(), 200_000);
        drop(current);
    }
}
