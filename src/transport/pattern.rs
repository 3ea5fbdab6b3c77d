//! Topic pattern matching
//!
//! AMQP-style subject patterns over dot-separated words: `*` matches exactly
//! one word, `#` matches zero or more words, anything else matches itself.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Segment {
    Word(String),
    Star,
    Hash,
}

/// A parsed binding pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse a dot-separated pattern
    pub fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('.')
            .map(|word| match word {
                "*" => Segment::Star,
                "#" => Segment::Hash,
                other => Segment::Word(other.to_string()),
            })
            .collect();
        TopicPattern { segments }
    }

    /// Check whether a routing key matches this pattern
    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split('.').collect();
        matches_at(&self.segments, &words)
    }
}

fn matches_at(pattern: &[Segment], words: &[&str]) -> bool {
    match pattern.first() {
        None => words.is_empty(),
        Some(Segment::Word(w)) => {
            words.first().is_some_and(|head| head == w) && matches_at(&pattern[1..], &words[1..])
        }
        Some(Segment::Star) => !words.is_empty() && matches_at(&pattern[1..], &words[1..]),
        Some(Segment::Hash) => {
            matches_at(&pattern[1..], words)
                || (!words.is_empty() && matches_at(pattern, &words[1..]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("registration", "registration", true; "exact word")]
    #[test_case("registration", "deregistration", false; "different word")]
    #[test_case("#.w1.#", "newModel.w1", true; "hash around trailing id")]
    #[test_case("#.w1.#", "newModel.w0.w1.w2", true; "hash around middle id")]
    #[test_case("#.w1.#", "w1", true; "hash matches zero words")]
    #[test_case("#.w1.#", "newModel.w0.w2", false; "id absent")]
    #[test_case("#.w1", "request.w1", true; "hash prefix")]
    #[test_case("#.w1", "request.w10", false; "no partial word match")]
    #[test_case("request.*", "request.w1", true; "star one word")]
    #[test_case("request.*", "request.w1.w2", false; "star exactly one word")]
    #[test_case("#", "anything.at.all", true; "hash alone")]
    fn test_pattern(pattern: &str, key: &str, expected: bool) {
        assert_eq!(TopicPattern::parse(pattern).matches(key), expected);
    }
}
