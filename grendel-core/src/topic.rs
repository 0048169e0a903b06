//! MQTT topic names, filters, and wildcard matching.
//!
//! Matching is level-structural: a topic is a sequence of `/`-separated
//! levels, `+` consumes exactly one level, and `#` (only valid as the last
//! filter level) consumes the remainder, including zero levels.

use thiserror::Error;

/// Maximum topic name/filter length in bytes (UTF-8 encoded).
pub const MAX_TOPIC_LENGTH: usize = 65535;

/// Single-level wildcard.
pub const WILDCARD_SINGLE: &str = "+";

/// Multi-level wildcard.
pub const WILDCARD_MULTI: &str = "#";

/// Error type for topic validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic name cannot be empty")]
    Empty,

    #[error("topic name exceeds maximum length of {MAX_TOPIC_LENGTH} bytes")]
    TooLong,

    #[error("topic name cannot contain null character")]
    ContainsNullChar,

    #[error("wildcard characters (+, #) not allowed in topic names")]
    WildcardInTopicName,

    #[error("single-level wildcard (+) must occupy entire topic level")]
    InvalidSingleLevelWildcard,

    #[error("multi-level wildcard (#) must be at end and occupy entire level")]
    InvalidMultiLevelWildcard,
}

/// Split a topic or filter into its levels.
pub fn levels(topic: &str) -> Vec<&str> {
    topic.split('/').collect()
}

/// True if the filter contains a `+` or `#` wildcard level.
pub fn is_wildcard(filter: &str) -> bool {
    filter
        .split('/')
        .any(|level| level == WILDCARD_SINGLE || level == WILDCARD_MULTI)
}

/// Test whether a topic filter matches a concrete topic name.
///
/// `matches("+/b", "a/b")`, `matches("a/#", "a")` and
/// `matches("a/#", "a/b/c")` all hold; `matches("a/+", "a/b/c")` does not.
pub fn matches(filter: &str, topic: &str) -> bool {
    matches_levels(&levels(filter), &levels(topic))
}

/// Level-wise variant of [`matches`] for callers that already split.
pub fn matches_levels(filter: &[&str], topic: &[&str]) -> bool {
    let mut topic_idx = 0;

    for (filter_idx, level) in filter.iter().enumerate() {
        if *level == WILDCARD_MULTI {
            // Valid only as the final level; matches the remainder,
            // including zero levels.
            return filter_idx == filter.len() - 1;
        }

        if topic_idx >= topic.len() {
            return false;
        }

        if *level != WILDCARD_SINGLE && *level != topic[topic_idx] {
            return false;
        }
        topic_idx += 1;
    }

    topic_idx == topic.len()
}

/// Validate a concrete topic name (as used on publish).
///
/// Topic names must be non-empty, at most [`MAX_TOPIC_LENGTH`] bytes, free
/// of NUL characters, and free of wildcard characters.
pub fn validate_name(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;

    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::WildcardInTopicName);
    }

    Ok(())
}

/// Validate a topic filter (as used on subscribe and in ACL patterns).
///
/// `+` must occupy an entire level; `#` must occupy an entire level and be
/// the last one.
pub fn validate_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;

    let parts = levels(filter);
    for (i, level) in parts.iter().enumerate() {
        if level.contains('+') && *level != WILDCARD_SINGLE {
            return Err(TopicError::InvalidSingleLevelWildcard);
        }

        if level.contains('#') {
            if *level != WILDCARD_MULTI {
                return Err(TopicError::InvalidMultiLevelWildcard);
            }
            if i != parts.len() - 1 {
                return Err(TopicError::InvalidMultiLevelWildcard);
            }
        }
    }

    Ok(())
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }

    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong);
    }

    if topic.contains('\0') {
        return Err(TopicError::ContainsNullChar);
    }

    Ok(())
}
