//! Topic construction for the device update protocol
//!
//! The agent publishes to `adu/oto/{device}/a` and receives responses on
//! `adu/oto/{device}/s`. Once a scope id is assigned by enrollment, both
//! topics gain a `/{scope}` suffix.

use thiserror::Error;

const TOPIC_PREFIX: &str = "adu/oto";

/// Topic validation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TopicError {
    #[error("external device id cannot be empty")]
    EmptyDeviceId,
    #[error("topic segment '{0}' contains a wildcard or separator")]
    InvalidSegment(String),
}

/// Builds the agent's publish and subscribe topics
pub struct TopicBuilder;

impl TopicBuilder {
    /// Agent-to-service topic: `adu/oto/{device}/a[/{scope}]`
    pub fn publish_topic(device_id: &str, scope_id: Option<&str>) -> Result<String, TopicError> {
        Self::build(device_id, "a", scope_id)
    }

    /// Service-to-agent topic: `adu/oto/{device}/s[/{scope}]`
    pub fn subscribe_topic(device_id: &str, scope_id: Option<&str>) -> Result<String, TopicError> {
        Self::build(device_id, "s", scope_id)
    }

    fn build(device_id: &str, direction: &str, scope_id: Option<&str>) -> Result<String, TopicError> {
        if device_id.is_empty() {
            return Err(TopicError::EmptyDeviceId);
        }
        validate_segment(device_id)?;

        match scope_id.filter(|s| !s.is_empty()) {
            Some(scope) => {
                validate_segment(scope)?;
                Ok(format!("{TOPIC_PREFIX}/{device_id}/{direction}/{scope}"))
            }
            None => Ok(format!("{TOPIC_PREFIX}/{device_id}/{direction}")),
        }
    }
}

fn validate_segment(segment: &str) -> Result<(), TopicError> {
    if segment.contains(['/', '+', '#']) {
        return Err(TopicError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unscoped_topics() {
        assert_eq!(
            TopicBuilder::publish_topic("device-1", None).unwrap(),
            "adu/oto/device-1/a"
        );
        assert_eq!(
            TopicBuilder::subscribe_topic("device-1", None).unwrap(),
            "adu/oto/device-1/s"
        );
    }

    #[test]
    fn test_scoped_topics() {
        assert_eq!(
            TopicBuilder::publish_topic("device-1", Some("scope-9")).unwrap(),
            "adu/oto/device-1/a/scope-9"
        );
        assert_eq!(
            TopicBuilder::subscribe_topic("device-1", Some("scope-9")).unwrap(),
            "adu/oto/device-1/s/scope-9"
        );
    }

    #[test]
    fn test_empty_scope_is_unscoped() {
        assert_eq!(
            TopicBuilder::subscribe_topic("device-1", Some("")).unwrap(),
            "adu/oto/device-1/s"
        );
    }

    #[test]
    fn test_invalid_segments() {
        assert_eq!(
            TopicBuilder::publish_topic("", None),
            Err(TopicError::EmptyDeviceId)
        );
        assert!(TopicBuilder::publish_topic("dev/1", None).is_err());
        assert!(TopicBuilder::subscribe_topic("dev", Some("#")).is_err());
    }

    proptest! {
        #[test]
        fn publish_and_subscribe_differ_only_in_direction(device in "[a-zA-Z0-9._-]{1,32}") {
            let publish = TopicBuilder::publish_topic(&device, None).unwrap();
            let subscribe = TopicBuilder::subscribe_topic(&device, None).unwrap();
            prop_assert_eq!(publish.trim_end_matches('a'), subscribe.trim_end_matches('s'));
        }
    }
}
