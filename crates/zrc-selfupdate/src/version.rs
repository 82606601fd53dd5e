//! Release version values.
//!
//! Versions are dot-separated non-negative integers of any length, with an
//! optional single leading prefix character such as `v`. Components missing
//! on one side of a comparison count as zero, so `1.2` and `1.2.0` are equal.
//!
//! Pre-release and build-metadata suffixes (`1.0.0-rc1`, `1.0.0+build`) are
//! not supported and fail to parse.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::ParseError;

/// An ordered sequence of numeric version components.
#[derive(Debug, Clone)]
pub struct Version {
    components: Vec<u64>,
}

impl Version {
    /// Parse a version string such as `v0.3`, `0.3.1` or `1.2.3.4`.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let trimmed = text.trim();
        let body = match trimmed.chars().next() {
            Some(c) if !c.is_ascii_digit() => &trimmed[c.len_utf8()..],
            _ => trimmed,
        };

        if body.is_empty() {
            return Err(ParseError::Empty);
        }

        let components = body
            .split('.')
            .map(|part| {
                // u64::from_str accepts a leading '+', which is not a version digit
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ParseError::InvalidComponent {
                        input: text.to_string(),
                        component: part.to_string(),
                    });
                }
                part.parse::<u64>().map_err(|_| ParseError::InvalidComponent {
                    input: text.to_string(),
                    component: part.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { components })
    }

    /// Build a version from explicit components.
    ///
    /// An empty list is treated as `0`.
    pub fn from_components(components: impl Into<Vec<u64>>) -> Self {
        let mut components = components.into();
        if components.is_empty() {
            components.push(0);
        }
        Self { components }
    }

    /// Version of this crate, used as a fallback for the host version.
    pub fn current() -> Self {
        Self::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Self::from_components([0]))
    }

    /// The parsed components, in order.
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Returns true if `self` is strictly newer than `other`.
    pub fn is_newer(&self, other: &Version) -> bool {
        self > other
    }

    /// Canonical `v{a}.{b}...` form.
    pub fn to_display_string(&self) -> String {
        self.to_string()
    }

    fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }

    /// Components with trailing zeros removed, the form equality is based on.
    fn significant(&self) -> &[u64] {
        let len = self
            .components
            .iter()
            .rposition(|&c| c != 0)
            .map_or(0, |i| i + 1);
        &self.components[..len]
    }
}

/// Returns true if `a` is strictly newer than `b`.
pub fn is_newer(a: &Version, b: &Version) -> bool {
    a.is_newer(b)
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v")?;
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", component)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
