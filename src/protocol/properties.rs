//! MQTT v5 message property codec
//!
//! Reads and writes the application headers carried in a message's property
//! list: the message-type tag (`mt`), the protocol id (`pid`), result codes,
//! correlation data and free-form user properties. Everything here is pure;
//! the transport converts [`MessageProperties`] to and from the MQTT client's
//! own property type.

use super::correlation::CorrelationId;
use super::messages::{
    CommonResponseProperties, MessageType, CONTENT_TYPE_JSON, PROPERTY_EXTENDED_RESULT_CODE,
    PROPERTY_MESSAGE_TYPE, PROPERTY_PROTOCOL_ID, PROPERTY_RESULT_CODE, PROTOCOL_VERSION,
    PROTOCOL_VERSION_NUMBER,
};
use bytes::Bytes;
use thiserror::Error;

/// Property validation failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PropertyError {
    #[error("missing user property '{0}'")]
    MissingProperty(String),
    #[error("user property '{key}' is not an int32: '{value}'")]
    NotAnInteger { key: String, value: String },
    #[error("protocol id mismatch: expected 1, got {0}")]
    ProtocolIdMismatch(i32),
    #[error("message type mismatch: expected '{expected}', got '{actual}'")]
    MessageTypeMismatch { expected: String, actual: String },
}

/// Properties attached to a published or received message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub correlation_data: Option<Bytes>,
    pub content_type: Option<String>,
    pub user_properties: Vec<(String, String)>,
    pub message_expiry_interval: Option<u32>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard request properties: `mt`, `pid`, JSON content type and correlation data
    pub fn for_request(message_type: MessageType, correlation_id: &CorrelationId) -> Self {
        let mut props = Self::new();
        props.add_user_property(PROPERTY_MESSAGE_TYPE, message_type.as_str());
        props.add_user_property(PROPERTY_PROTOCOL_ID, PROTOCOL_VERSION);
        props.set_content_type(CONTENT_TYPE_JSON);
        props.set_correlation_id(correlation_id);
        props
    }

    pub fn add_user_property(&mut self, key: &str, value: &str) {
        self.user_properties
            .push((key.to_string(), value.to_string()));
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(content_type.to_string());
    }

    pub fn set_correlation_id(&mut self, correlation_id: &CorrelationId) {
        self.correlation_data = Some(Bytes::copy_from_slice(correlation_id.as_bytes()));
    }

    /// First value of user property `key`
    pub fn read_user_property(&self, key: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// True when some user property `key` has exactly `value`
    pub fn has_user_property(&self, key: &str, value: &str) -> bool {
        self.user_properties
            .iter()
            .any(|(k, v)| k == key && v == value)
    }

    /// Parse user property `key` as an int32
    ///
    /// The whole value must be the integer; surrounding whitespace or
    /// trailing text is an error, never a panic. Callers that want the zero
    /// default use `unwrap_or_default()`.
    pub fn read_user_property_as_i32(&self, key: &str) -> Result<i32, PropertyError> {
        let value = self
            .read_user_property(key)
            .ok_or_else(|| PropertyError::MissingProperty(key.to_string()))?;
        value
            .parse::<i32>()
            .map_err(|_| PropertyError::NotAnInteger {
                key: key.to_string(),
                value: value.to_string(),
            })
    }

    pub fn message_type(&self) -> Option<&str> {
        self.read_user_property(PROPERTY_MESSAGE_TYPE)
    }
}

/// Validate the envelope every inbound message must carry: an `mt` tag and `pid == 1`
pub fn validate_envelope(props: &MessageProperties) -> Result<MessageType, PropertyError> {
    let tag = props
        .message_type()
        .ok_or_else(|| PropertyError::MissingProperty(PROPERTY_MESSAGE_TYPE.to_string()))?;
    let pid = props.read_user_property_as_i32(PROPERTY_PROTOCOL_ID)?;
    if pid != PROTOCOL_VERSION_NUMBER {
        return Err(PropertyError::ProtocolIdMismatch(pid));
    }
    MessageType::parse(tag).ok_or_else(|| PropertyError::MessageTypeMismatch {
        expected: "a known message type".to_string(),
        actual: tag.to_string(),
    })
}

/// Parse and validate the user properties common to every response
///
/// Fails when `pid` is not 1 or when `mt` is not `expected`. This is the gate
/// that keeps operation modules from acting on foreign messages.
pub fn read_common_response_properties(
    props: &MessageProperties,
    expected: MessageType,
) -> Result<CommonResponseProperties, PropertyError> {
    let message_type = props
        .message_type()
        .ok_or_else(|| PropertyError::MissingProperty(PROPERTY_MESSAGE_TYPE.to_string()))?;
    let pid = props.read_user_property_as_i32(PROPERTY_PROTOCOL_ID)?;
    let result_code = props.read_user_property_as_i32(PROPERTY_RESULT_CODE)?;
    let extended_result_code = props.read_user_property_as_i32(PROPERTY_EXTENDED_RESULT_CODE)?;

    if pid != PROTOCOL_VERSION_NUMBER {
        return Err(PropertyError::ProtocolIdMismatch(pid));
    }

    if message_type != expected.as_str() {
        return Err(PropertyError::MessageTypeMismatch {
            expected: expected.as_str().to_string(),
            actual: message_type.to_string(),
        });
    }

    Ok(CommonResponseProperties {
        pid,
        result_code,
        extended_result_code,
    })
}

/// Byte-exact comparison of a message's correlation data with `expected`
pub fn correlation_matches(props: &MessageProperties, expected: &CorrelationId) -> bool {
    match &props.correlation_data {
        Some(data) => data.as_ref() == expected.as_bytes(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_props(mt: &str, pid: &str, rc: &str, erc: &str) -> MessageProperties {
        let mut props = MessageProperties::new();
        props.add_user_property("mt", mt);
        props.add_user_property("pid", pid);
        props.add_user_property("resultcode", rc);
        props.add_user_property("extendedresultcode", erc);
        props
    }

    #[test]
    fn test_request_properties() {
        let cid = CorrelationId::parse("abc-123").unwrap();
        let props = MessageProperties::for_request(MessageType::EnrollmentRequest, &cid);

        assert!(props.has_user_property("mt", "enr_req"));
        assert!(props.has_user_property("pid", "1"));
        assert_eq!(props.content_type.as_deref(), Some("json"));
        assert_eq!(props.correlation_data.as_deref(), Some(&b"abc-123"[..]));
    }

    #[test]
    fn test_read_int_property() {
        let props = response_props("upd_resp", "1", "-4", "0x10");

        assert_eq!(props.read_user_property_as_i32("resultcode"), Ok(-4));
        assert!(matches!(
            props.read_user_property_as_i32("extendedresultcode"),
            Err(PropertyError::NotAnInteger { .. })
        ));
        assert_eq!(
            props
                .read_user_property_as_i32("extendedresultcode")
                .unwrap_or_default(),
            0
        );
        assert_eq!(
            props.read_user_property_as_i32("absent"),
            Err(PropertyError::MissingProperty("absent".to_string()))
        );
    }

    #[test]
    fn test_int_property_must_be_the_whole_value() {
        for value in [" 4 ", "4 ", "4abc", ""] {
            let props = response_props("upd_resp", "1", value, "0");
            assert!(
                matches!(
                    props.read_user_property_as_i32("resultcode"),
                    Err(PropertyError::NotAnInteger { .. })
                ),
                "{value:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_common_response_properties_success() {
        let props = response_props("enr_resp", "1", "3", "7");
        let common =
            read_common_response_properties(&props, MessageType::EnrollmentResponse).unwrap();

        assert_eq!(common.pid, 1);
        assert_eq!(common.result_code, 3);
        assert_eq!(common.extended_result_code, 7);
        assert!(!common.is_success());
    }

    #[test]
    fn test_common_response_properties_rejects_wrong_pid() {
        let props = response_props("enr_resp", "2", "0", "0");
        assert_eq!(
            read_common_response_properties(&props, MessageType::EnrollmentResponse),
            Err(PropertyError::ProtocolIdMismatch(2))
        );
    }

    #[test]
    fn test_common_response_properties_rejects_wrong_type() {
        let props = response_props("upd_resp", "1", "0", "0");
        assert!(matches!(
            read_common_response_properties(&props, MessageType::EnrollmentResponse),
            Err(PropertyError::MessageTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_common_response_properties_requires_result_codes() {
        let mut props = MessageProperties::new();
        props.add_user_property("mt", "enr_resp");
        props.add_user_property("pid", "1");

        assert_eq!(
            read_common_response_properties(&props, MessageType::EnrollmentResponse),
            Err(PropertyError::MissingProperty("resultcode".to_string()))
        );
    }

    #[test]
    fn test_correlation_matching_is_byte_exact() {
        let cid = CorrelationId::parse("0123456789abcdef0123456789abcdef").unwrap();
        let mut props = MessageProperties::new();

        assert!(!correlation_matches(&props, &cid));

        props.correlation_data = Some(Bytes::from_static(b"0123456789abcdef0123456789abcdef"));
        assert!(correlation_matches(&props, &cid));

        props.correlation_data = Some(Bytes::from_static(b"0123456789abcdef0123456789abcdeF"));
        assert!(!correlation_matches(&props, &cid));

        // a prefix of the live id is not a match
        props.correlation_data = Some(Bytes::from_static(b"0123456789abcdef"));
        assert!(!correlation_matches(&props, &cid));
    }

    #[test]
    fn test_validate_envelope() {
        let props = response_props("upd_cn", "1", "0", "0");
        assert_eq!(
            validate_envelope(&props),
            Ok(MessageType::UpdateAvailableNotification)
        );

        let mut no_type = MessageProperties::new();
        no_type.add_user_property("pid", "1");
        assert!(validate_envelope(&no_type).is_err());

        let wrong_pid = response_props("upd_cn", "9", "0", "0");
        assert_eq!(
            validate_envelope(&wrong_pid),
            Err(PropertyError::ProtocolIdMismatch(9))
        );
    }
}
