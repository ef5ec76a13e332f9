//! Request classification and origin admission
//!
//! The classifier maps a request to a fetch strategy by walking an ordered rule
//! list, first match wins. The admission filter runs before it and keeps
//! third-party traffic out of the cache entirely.

use std::fmt;

use reqwest::Method;
use serde::Serialize;
use url::{Origin, Url};

use crate::config::RoutingSettings;
use crate::request::Request;

/// How a request is reconciled between cache and network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Not intercepted; sent straight to the transport
    Bypass,
    /// Network, falling back to the cache and then the offline page
    NetworkFirst,
    /// Cache, falling back to the network
    CacheFirst,
    /// Cache immediately, refreshing from the network in the background
    StaleWhileRevalidate,
}

impl Strategy {
    /// Stable name used in logs and CLI output
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Bypass => "bypass",
            Strategy::NetworkFirst => "network-first",
            Strategy::CacheFirst => "cache-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition tested by a routing rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Method is anything but `GET`
    NotGet,
    /// Page navigation, or an accept header naming an HTML media type
    Document,
    /// Path starts with one of the prefixes
    PathPrefix(Vec<String>),
    /// Final path segment has one of the extensions (case-insensitive)
    Extension(Vec<String>),
    /// Any of the inner predicates
    AnyOf(Vec<Predicate>),
    /// Matches every request
    Always,
}

impl Predicate {
    /// Tests the predicate against a request
    pub fn matches(&self, request: &Request) -> bool {
        match self {
            Predicate::NotGet => request.method != Method::GET,
            Predicate::Document => request.is_navigation() || request.accepts_html(),
            Predicate::PathPrefix(prefixes) => {
                let path = request.url.path();
                prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
            }
            Predicate::Extension(extensions) => extension(&request.url).is_some_and(|ext| {
                extensions
                    .iter()
                    .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(ext))
            }),
            Predicate::AnyOf(predicates) => predicates.iter().any(|p| p.matches(request)),
            Predicate::Always => true,
        }
    }
}

fn extension(url: &Url) -> Option<&str> {
    let segment = url.path_segments()?.next_back()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    (!stem.is_empty() && !ext.is_empty()).then_some(ext)
}

/// An ordered `(predicate, strategy)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    pub predicate: Predicate,
    pub strategy: Strategy,
}

impl RoutingRule {
    pub fn new(predicate: Predicate, strategy: Strategy) -> Self {
        Self {
            predicate,
            strategy,
        }
    }
}

/// Fixed, ordered rule list evaluated first-match-wins
///
/// The table is always total: a trailing `Always -> NetworkFirst` rule is added
/// when the supplied rules do not end in an `Always` predicate.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
}

impl RoutingTable {
    /// Builds a table from explicit rules
    pub fn new(mut rules: Vec<RoutingRule>) -> Self {
        let terminated = rules
            .last()
            .is_some_and(|rule| rule.predicate == Predicate::Always);
        if !terminated {
            rules.push(RoutingRule::new(Predicate::Always, Strategy::NetworkFirst));
        }
        Self { rules }
    }

    /// Builds the standard table from routing conventions
    ///
    /// 1. non-`GET` → bypass
    /// 2. navigation or HTML accept → network-first
    /// 3. asset prefix or extension → cache-first
    /// 4. API prefix → stale-while-revalidate
    /// 5. anything else → network-first
    pub fn from_settings(settings: &RoutingSettings) -> Self {
        Self::new(vec![
            RoutingRule::new(Predicate::NotGet, Strategy::Bypass),
            RoutingRule::new(Predicate::Document, Strategy::NetworkFirst),
            RoutingRule::new(
                Predicate::AnyOf(vec![
                    Predicate::PathPrefix(settings.asset_prefixes.clone()),
                    Predicate::Extension(settings.asset_extensions.clone()),
                ]),
                Strategy::CacheFirst,
            ),
            RoutingRule::new(
                Predicate::PathPrefix(settings.api_prefixes.clone()),
                Strategy::StaleWhileRevalidate,
            ),
            RoutingRule::new(Predicate::Always, Strategy::NetworkFirst),
        ])
    }

    /// The rules in evaluation order
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Picks the strategy of the first matching rule
    pub fn classify(&self, request: &Request) -> Strategy {
        self.rules
            .iter()
            .find(|rule| rule.predicate.matches(request))
            .map(|rule| rule.strategy)
            .unwrap_or(Strategy::NetworkFirst)
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::from_settings(&RoutingSettings::default())
    }
}

/// Admits only the application's own origin and allow-listed hosts
#[derive(Debug, Clone)]
pub struct AdmissionFilter {
    origin: Origin,
    allowed_hosts: Vec<String>,
}

impl AdmissionFilter {
    pub fn new<I, S>(origin: &Url, allowed_hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            origin: origin.origin(),
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|host| host.into().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Whether the request may be routed through the cache
    pub fn admits(&self, request: &Request) -> bool {
        if request.url.origin() == self.origin {
            return true;
        }
        request
            .url
            .host_str()
            .is_some_and(|host| self.allowed_hosts.iter().any(|allowed| allowed == host))
    }
}
