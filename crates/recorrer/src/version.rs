//! Product version comparison and version-dependent value picking.

use std::cmp::Ordering;

/// A dotted product version, compared numerically segment by segment.
/// Non-numeric segments compare lexicographically after numeric ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    segments: Vec<Segment>,
    raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Number(u64),
    Text(String),
}

impl Version {
    /// Parse a dotted version string
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let segments = raw
            .split('.')
            .map(|part| {
                part.parse::<u64>()
                    .map_or_else(|_| Segment::Text(part.to_string()), Segment::Number)
            })
            .collect();
        Self {
            segments,
            raw: raw.to_string(),
        }
    }

    /// The original string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).unwrap_or(&Segment::Number(0));
            let b = other.segments.get(i).unwrap_or(&Segment::Number(0));
            let ord = match (a, b) {
                (Segment::Number(x), Segment::Number(y)) => x.cmp(y),
                (Segment::Number(_), Segment::Text(_)) => Ordering::Less,
                (Segment::Text(_), Segment::Number(_)) => Ordering::Greater,
                (Segment::Text(x), Segment::Text(y)) => x.cmp(y),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Pick a value based on the product version: the entry with the highest
/// version not exceeding the asked-for one wins.
#[derive(Debug, Clone)]
pub struct VersionPick<T> {
    variants: Vec<(Version, T)>,
}

impl<T: Clone> VersionPick<T> {
    /// Build from (version, value) pairs
    #[must_use]
    pub fn new(pairs: impl IntoIterator<Item = (&'static str, T)>) -> Self {
        let mut variants: Vec<_> = pairs
            .into_iter()
            .map(|(v, value)| (Version::parse(v), value))
            .collect();
        variants.sort_by(|a, b| a.0.cmp(&b.0));
        Self { variants }
    }

    /// Pick the variant for the given version, `None` when every variant
    /// is newer.
    #[must_use]
    pub fn pick(&self, version: &Version) -> Option<&T> {
        self.variants
            .iter()
            .rev()
            .find(|(candidate, _)| candidate <= version)
            .map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_ordering() {
        assert!(Version::parse("5.9") < Version::parse("5.10"));
        assert!(Version::parse("5.10.1") > Version::parse("5.10"));
        assert_eq!(Version::parse("5.10.0"), Version::parse("5.10"));
    }

    #[test]
    fn test_text_segments_sort_after_numbers() {
        assert!(Version::parse("5.9") < Version::parse("5.beta"));
    }

    #[test]
    fn test_pick_latest_not_exceeding() {
        let pick = VersionPick::new([("5.8", "old"), ("5.10", "new")]);
        assert_eq!(pick.pick(&Version::parse("5.9")), Some(&"old"));
        assert_eq!(pick.pick(&Version::parse("5.10.1")), Some(&"new"));
        assert_eq!(pick.pick(&Version::parse("5.7")), None);
    }
}
