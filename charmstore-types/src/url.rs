//! Charm URL parsing and formatting.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error returned when a charm URL fails to parse.
#[derive(Debug, Clone, Error)]
#[error("invalid charm URL {url:?}: {reason}")]
pub struct ParseUrlError {
    url: String,
    reason: &'static str,
}

impl ParseUrlError {
    fn new(url: &str, reason: &'static str) -> Self {
        Self {
            url: url.to_owned(),
            reason,
        }
    }
}

/// The identifier of a charm store entity.
///
/// The textual form is `[~user/][series/]name[-revision]`. A URL without a
/// user is in *promulgated* form and resolves through the promulgation
/// aliases rather than directly.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharmUrl {
    user: Option<String>,
    series: Option<String>,
    name: String,
    revision: Option<i32>,
}

impl CharmUrl {
    /// Creates a URL from its components.
    pub fn new(
        user: Option<&str>,
        series: Option<&str>,
        name: &str,
        revision: Option<i32>,
    ) -> Self {
        Self {
            user: user.map(str::to_owned),
            series: series.map(str::to_owned),
            name: name.to_owned(),
            revision,
        }
    }

    /// The owning user, absent for promulgated-form URLs.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// The distribution series, if the URL carries one.
    pub fn series(&self) -> Option<&str> {
        self.series.as_deref()
    }

    /// The charm or bundle name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The revision, absent when the URL refers to the latest revision.
    pub fn revision(&self) -> Option<i32> {
        self.revision
    }

    /// Returns the base form of the URL: user and name only.
    ///
    /// This is the key of the base entity owning all revisions.
    pub fn base(&self) -> CharmUrl {
        CharmUrl {
            user: self.user.clone(),
            series: None,
            name: self.name.clone(),
            revision: None,
        }
    }

    /// Returns a copy of the URL with the given revision.
    pub fn with_revision(&self, revision: i32) -> CharmUrl {
        CharmUrl {
            revision: Some(revision),
            ..self.clone()
        }
    }
}

impl fmt::Display for CharmUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "~{user}/")?;
        }
        if let Some(series) = &self.series {
            write!(f, "{series}/")?;
        }
        f.write_str(&self.name)?;
        if let Some(revision) = self.revision {
            write!(f, "-{revision}")?;
        }
        Ok(())
    }
}

// Debug output matches the textual form, which is what log lines and error
// annotations want.
impl fmt::Debug for CharmUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for CharmUrl {
    type Err = ParseUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("cs:").unwrap_or(s);
        let mut segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(ParseUrlError::new(s, "empty path segment"));
        }
        if segments.len() > 3 {
            return Err(ParseUrlError::new(s, "too many path segments"));
        }

        let user = if segments[0].starts_with('~') {
            let user = &segments.remove(0)[1..];
            if user.is_empty() {
                return Err(ParseUrlError::new(s, "empty user"));
            }
            Some(user.to_owned())
        } else {
            None
        };

        let last = segments
            .pop()
            .ok_or_else(|| ParseUrlError::new(s, "missing name"))?;
        let series = match segments.pop() {
            Some(series) if !is_valid_series(series) => {
                return Err(ParseUrlError::new(s, "invalid series"));
            }
            Some(series) => Some(series.to_owned()),
            None => None,
        };
        if !segments.is_empty() {
            return Err(ParseUrlError::new(s, "user must come first"));
        }

        let (name, revision) = split_revision(last);
        if !is_valid_name(name) {
            return Err(ParseUrlError::new(s, "invalid name"));
        }

        Ok(CharmUrl {
            user,
            series,
            name: name.to_owned(),
            revision,
        })
    }
}

/// Splits a trailing `-<digits>` revision suffix off a name.
fn split_revision(s: &str) -> (&str, Option<i32>) {
    if let Some((name, rev)) = s.rsplit_once('-') {
        if !name.is_empty() && !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(revision) = rev.parse() {
                return (name, Some(revision));
            }
        }
    }
    (s, None)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

fn is_valid_series(series: &str) -> bool {
    !series.is_empty() && series.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

impl Serialize for CharmUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CharmUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> CharmUrl {
        s.parse().unwrap()
    }

    #[test]
    fn parse_roundtrip() {
        for s in [
            "wordpress",
            "wordpress-5",
            "trusty/django-42",
            "~bob/wordpress-1",
            "~who/utopic/rails-47",
            "~charmers/trusty/juju-gui-18",
        ] {
            assert_eq!(parse(s).to_string(), s, "{s}");
        }
    }

    #[test]
    fn parse_components() {
        let url = parse("~who/utopic/rails-47");
        assert_eq!(url.user(), Some("who"));
        assert_eq!(url.series(), Some("utopic"));
        assert_eq!(url.name(), "rails");
        assert_eq!(url.revision(), Some(47));

        let url = parse("wordpress-5");
        assert_eq!(url.user(), None);
        assert_eq!(url.series(), None);
        assert_eq!(url.revision(), Some(5));
    }

    #[test]
    fn parse_dashed_name() {
        let url = parse("juju-gui-42");
        assert_eq!(url.name(), "juju-gui");
        assert_eq!(url.revision(), Some(42));

        let url = parse("juju-gui");
        assert_eq!(url.name(), "juju-gui");
        assert_eq!(url.revision(), None);
    }

    #[test]
    fn parse_cs_prefix() {
        assert_eq!(parse("cs:~bob/wordpress-1"), parse("~bob/wordpress-1"));
    }

    #[test]
    fn parse_rejects_malformed() {
        for s in ["", "~/wordpress", "a/b/c/d", "trusty/", "Wordpress", "x/~bob/y"] {
            assert!(s.parse::<CharmUrl>().is_err(), "{s:?} should not parse");
        }
    }

    #[test]
    fn base_drops_series_and_revision() {
        assert_eq!(parse("~bob/trusty/wordpress-1").base(), parse("~bob/wordpress"));
        assert_eq!(parse("wordpress-5").base(), parse("wordpress"));
    }

    #[test]
    fn serde_as_string() {
        let url = parse("~bob/wordpress-1");
        let json = serde_json::to_string(&url).unwrap();
        assert_eq!(json, "\"~bob/wordpress-1\"");
        let back: CharmUrl = serde_json::from_str(&json).unwrap();
        assert_eq!(back, url);
    }
}
