//! The principal descriptor sealed inside a token.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{GuardError, Result};
use crate::ratelimit::RateSpec;

/// A path restriction: requests are allowed when the pattern matches
/// anywhere in the request path (anchor it with `^` to restrict prefixes).
#[derive(Clone)]
pub struct PathPattern {
    regex: Regex,
}

impl PathPattern {
    /// Compile a pattern from its source.
    pub fn new(source: &str) -> Result<Self> {
        Ok(Self {
            regex: Regex::new(source)?,
        })
    }

    /// The pattern source, as stored inside tokens.
    pub fn source(&self) -> &str {
        self.regex.as_str()
    }

    /// Whether `path` is allowed by this pattern.
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

impl From<Regex> for PathPattern {
    fn from(regex: Regex) -> Self {
        Self { regex }
    }
}

impl FromStr for PathPattern {
    type Err = GuardError;

    fn from_str(source: &str) -> Result<Self> {
        Self::new(source)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source() == other.source()
    }
}

impl Eq for PathPattern {}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathPattern({:?})", self.source())
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source())
    }
}

/// Token expiration in any of the accepted input shapes.
///
/// Decoded principals always carry [`Expiration::EpochMillis`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiration {
    /// A concrete instant
    At(DateTime<Utc>),
    /// Milliseconds since the Unix epoch
    EpochMillis(i64),
    /// A date string: RFC 3339, RFC 2822, `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SS` (UTC)
    Text(String),
}

impl Expiration {
    /// Resolve to milliseconds since the Unix epoch.
    pub fn resolve(&self) -> Result<i64> {
        match self {
            Expiration::At(instant) => Ok(instant.timestamp_millis()),
            Expiration::EpochMillis(millis) => Ok(*millis),
            Expiration::Text(text) => parse_date(text)
                .map(|instant| instant.timestamp_millis())
                .ok_or_else(|| GuardError::UnparseableExpiration(text.clone())),
        }
    }
}

fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
        return Some(instant.with_timezone(&Utc));
    }
    if let Ok(instant) = DateTime::parse_from_rfc2822(text) {
        return Some(instant.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl From<DateTime<Utc>> for Expiration {
    fn from(instant: DateTime<Utc>) -> Self {
        Expiration::At(instant)
    }
}

impl From<i64> for Expiration {
    fn from(millis: i64) -> Self {
        Expiration::EpochMillis(millis)
    }
}

impl From<&str> for Expiration {
    fn from(text: &str) -> Self {
        Expiration::Text(text.to_string())
    }
}

impl From<String> for Expiration {
    fn from(text: String) -> Self {
        Expiration::Text(text)
    }
}

/// The authenticated entity a token represents.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    /// Opaque identifier, also the admission queue key
    pub id: String,
    /// Optional request path restriction
    pub path: Option<PathPattern>,
    /// Optional minimum spacing between requests; `None` means unthrottled
    pub rate: Option<RateSpec>,
    /// Optional expiration
    pub exp: Option<Expiration>,
    /// Additional issuer-defined claims, carried through the token untouched
    pub claims: Map<String, Value>,
}

impl Principal {
    /// Create an unrestricted, unthrottled principal.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: None,
            rate: None,
            exp: None,
            claims: Map::new(),
        }
    }

    /// Restrict the principal to paths matching `path`.
    pub fn with_path(mut self, path: PathPattern) -> Self {
        self.path = Some(path);
        self
    }

    /// Throttle the principal.
    pub fn with_rate(mut self, rate: impl Into<RateSpec>) -> Self {
        self.rate = Some(rate.into());
        self
    }

    /// Set an expiration.
    pub fn with_expiration(mut self, exp: impl Into<Expiration>) -> Self {
        self.exp = Some(exp.into());
        self
    }

    /// Attach an extra claim. Keys named `id`, `path`, `rate` or `exp` are
    /// dropped when the token is encoded.
    pub fn with_claim(mut self, key: impl Into<String>, value: Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }

    /// Whether the principal may access `path`.
    pub fn allows_path(&self, path: &str) -> bool {
        self.path.as_ref().map_or(true, |pattern| pattern.is_match(path))
    }

    /// Expiration in epoch millis, if one is set and resolvable.
    pub fn expires_at(&self) -> Option<i64> {
        self.exp.as_ref().and_then(|exp| exp.resolve().ok())
    }

    /// Whether the principal has expired at `now_millis`. An expiration that
    /// cannot be resolved counts as expired.
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        match &self.exp {
            None => false,
            Some(exp) => exp.resolve().map_or(true, |at| at <= now_millis),
        }
    }
}
