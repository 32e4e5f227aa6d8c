//! Topic Utilities
//!
//! Maps logical keys (`kitchen/light`) to the bus topics that carry them
//! (`kitchen/light/get`, `kitchen/light/set`, `kitchen/light/status`) and back.

use crate::types::{Error, Result};

/// Trailing marker that turns a subscription pattern into a prefix match.
pub const WILDCARD: char = '#';

/// Topic suffixes recognized by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Suffix {
    /// Request a value refresh
    Get,
    /// Request a value change
    Set,
    /// Last known value
    Status,
}

impl Suffix {
    pub const ALL: [Suffix; 3] = [Suffix::Get, Suffix::Set, Suffix::Status];

    pub fn as_str(&self) -> &'static str {
        match self {
            Suffix::Get => "get",
            Suffix::Set => "set",
            Suffix::Status => "status",
        }
    }

    fn parse(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == segment)
    }
}

impl std::fmt::Display for Suffix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the bus topic carrying `suffix` for a logical key
pub fn topic_for(key: &str, suffix: Suffix) -> String {
    format!("{}/{}", key, suffix.as_str())
}

/// Split a topic into its logical key and recognized suffix
///
/// Returns `None` for topics that do not end in `/get`, `/set` or `/status`.
pub fn split_topic(topic: &str) -> Option<(&str, Suffix)> {
    let (key, last) = topic.rsplit_once('/')?;
    if key.is_empty() {
        return None;
    }
    Suffix::parse(last).map(|suffix| (key, suffix))
}

/// Logical key of a topic, stripping its recognized suffix
pub fn key_for(topic: &str) -> Option<&str> {
    split_topic(topic).map(|(key, _)| key)
}

/// Logical key of a status topic, or `None` for any other topic
pub fn status_key(topic: &str) -> Option<&str> {
    match split_topic(topic) {
        Some((key, Suffix::Status)) => Some(key),
        _ => None,
    }
}

/// Check whether a topic matches a subscription pattern
///
/// Patterns match exactly, or as a prefix when they end with `#`:
///   pattern: "a/b/#" -> matches "a/b/c" and "a/b/c/d", not "a/x"
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }
    match pattern.strip_suffix(WILDCARD) {
        Some(prefix) => topic.starts_with(prefix),
        None => false,
    }
}

/// Linearly rescale `value` from `input = [a, b]` to `output = [c, d]`
///
/// Both ranges must hold exactly two elements and the input range must not be
/// zero-width. Values outside the input range extrapolate.
pub fn to_range(value: f64, input: &[f64], output: &[f64]) -> Result<f64> {
    let [a, b] = <[f64; 2]>::try_from(input)
        .map_err(|_| Error::Range(format!("input range needs 2 values, got {}", input.len())))?;
    let [c, d] = <[f64; 2]>::try_from(output)
        .map_err(|_| Error::Range(format!("output range needs 2 values, got {}", output.len())))?;

    if a == b {
        return Err(Error::Range(format!("input range [{}, {}] has zero width", a, b)));
    }

    Ok(c + (value - a) / (b - a) * (d - c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_round_trip() {
        for key in ["kitchen/light", "light", "house/floor1/room/lamp"] {
            for suffix in Suffix::ALL {
                let topic = topic_for(key, suffix);
                assert_eq!(key_for(&topic), Some(key));
                assert_eq!(split_topic(&topic), Some((key, suffix)));
            }
        }
    }

    #[test]
    fn test_topic_for() {
        assert_eq!(topic_for("kitchen/light", Suffix::Status), "kitchen/light/status");
        assert_eq!(topic_for("kitchen/light", Suffix::Get), "kitchen/light/get");
        assert_eq!(topic_for("kitchen/light", Suffix::Set), "kitchen/light/set");
    }

    #[test]
    fn test_unrecognized_topics() {
        assert_eq!(key_for("kitchen/light"), None);
        assert_eq!(key_for("status"), None);
        assert_eq!(key_for("/status"), None);
        assert_eq!(status_key("kitchen/light/set"), None);
        assert_eq!(status_key("kitchen/light/status"), Some("kitchen/light"));
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(topic_matches("a/b/#", "a/b/c"));
        assert!(topic_matches("a/b/#", "a/b/c/d"));
        assert!(!topic_matches("a/b/#", "a/x"));
        assert!(!topic_matches("a/b/c", "a/b/c/d"));
        assert!(topic_matches("#", "anything/at/all"));
    }

    #[test]
    fn test_to_range() {
        assert_eq!(to_range(5.0, &[0.0, 10.0], &[0.0, 100.0]).unwrap(), 50.0);
        assert_eq!(to_range(0.0, &[0.0, 1.0], &[100.0, 200.0]).unwrap(), 100.0);
        assert_eq!(to_range(255.0, &[0.0, 255.0], &[0.0, 100.0]).unwrap(), 100.0);
        assert_eq!(to_range(25.0, &[0.0, 100.0], &[100.0, 0.0]).unwrap(), 75.0);
    }

    #[test]
    fn test_to_range_invalid() {
        assert!(matches!(to_range(1.0, &[3.0, 3.0], &[0.0, 1.0]), Err(Error::Range(_))));
        assert!(matches!(to_range(1.0, &[0.0], &[0.0, 1.0]), Err(Error::Range(_))));
        assert!(matches!(to_range(1.0, &[0.0, 1.0], &[0.0, 1.0, 2.0]), Err(Error::Range(_))));
    }
}
