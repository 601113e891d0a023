//! Disconnect classification
//!
//! Maps MQTT v5 CONNACK/DISCONNECT reason codes to a coarse category the
//! session uses to pick a backoff tier and a log severity. NonRecoverable
//! codes need operator or configuration intervention; the agent still
//! retries them and leaves remediation to alerting.

use std::fmt;

/// MQTT v5 reason codes referenced by the agent
pub mod reason_codes {
    /// CONNACK accepted; shares the value of [`NORMAL_DISCONNECTION`]
    pub const SUCCESS: u8 = 0x00;
    pub const NORMAL_DISCONNECTION: u8 = 0x00;
    pub const DISCONNECT_WITH_WILL_MESSAGE: u8 = 0x04;
    pub const UNSPECIFIED_ERROR: u8 = 0x80;
    pub const MALFORMED_PACKET: u8 = 0x81;
    pub const PROTOCOL_ERROR: u8 = 0x82;
    pub const IMPLEMENTATION_SPECIFIC_ERROR: u8 = 0x83;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u8 = 0x84;
    pub const CLIENT_IDENTIFIER_NOT_VALID: u8 = 0x85;
    pub const BAD_USER_NAME_OR_PASSWORD: u8 = 0x86;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const SERVER_UNAVAILABLE: u8 = 0x88;
    pub const SERVER_BUSY: u8 = 0x89;
    pub const BANNED: u8 = 0x8A;
    pub const SERVER_SHUTTING_DOWN: u8 = 0x8B;
    pub const BAD_AUTHENTICATION_METHOD: u8 = 0x8C;
    pub const KEEP_ALIVE_TIMEOUT: u8 = 0x8D;
    pub const SESSION_TAKEN_OVER: u8 = 0x8E;
    pub const TOPIC_FILTER_INVALID: u8 = 0x8F;
    pub const TOPIC_NAME_INVALID: u8 = 0x90;
    pub const RECEIVE_MAXIMUM_EXCEEDED: u8 = 0x93;
    pub const TOPIC_ALIAS_INVALID: u8 = 0x94;
    pub const PACKET_TOO_LARGE: u8 = 0x95;
    pub const MESSAGE_RATE_TOO_HIGH: u8 = 0x96;
    pub const QUOTA_EXCEEDED: u8 = 0x97;
    pub const ADMINISTRATIVE_ACTION: u8 = 0x98;
    pub const PAYLOAD_FORMAT_INVALID: u8 = 0x99;
    pub const RETAIN_NOT_SUPPORTED: u8 = 0x9A;
    pub const QOS_NOT_SUPPORTED: u8 = 0x9B;
    pub const USE_ANOTHER_SERVER: u8 = 0x9C;
    pub const SERVER_MOVED: u8 = 0x9D;
    pub const SHARED_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0x9E;
    pub const CONNECTION_RATE_EXCEEDED: u8 = 0x9F;
    pub const MAXIMUM_CONNECT_TIME: u8 = 0xA0;
    pub const SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED: u8 = 0xA1;
    pub const WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0xA2;
}

use reason_codes::*;

/// Coarse disconnect category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCategory {
    Transient,
    NonRecoverable,
    Other,
}

impl fmt::Display for DisconnectCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCategory::Transient => f.write_str("transient"),
            DisconnectCategory::NonRecoverable => f.write_str("non-recoverable"),
            DisconnectCategory::Other => f.write_str("other"),
        }
    }
}

const CLASSIFICATION: &[(u8, DisconnectCategory)] = &[
    (NORMAL_DISCONNECTION, DisconnectCategory::Transient),
    (DISCONNECT_WITH_WILL_MESSAGE, DisconnectCategory::Transient),
    (UNSPECIFIED_ERROR, DisconnectCategory::Transient),
    (SERVER_BUSY, DisconnectCategory::Transient),
    (KEEP_ALIVE_TIMEOUT, DisconnectCategory::Transient),
    (USE_ANOTHER_SERVER, DisconnectCategory::Transient),
    (SERVER_MOVED, DisconnectCategory::Transient),
    (MALFORMED_PACKET, DisconnectCategory::NonRecoverable),
    (PROTOCOL_ERROR, DisconnectCategory::NonRecoverable),
    (IMPLEMENTATION_SPECIFIC_ERROR, DisconnectCategory::NonRecoverable),
    (NOT_AUTHORIZED, DisconnectCategory::NonRecoverable),
    (SERVER_SHUTTING_DOWN, DisconnectCategory::NonRecoverable),
    (SESSION_TAKEN_OVER, DisconnectCategory::NonRecoverable),
    (TOPIC_FILTER_INVALID, DisconnectCategory::NonRecoverable),
    (TOPIC_NAME_INVALID, DisconnectCategory::NonRecoverable),
    (RECEIVE_MAXIMUM_EXCEEDED, DisconnectCategory::NonRecoverable),
    (TOPIC_ALIAS_INVALID, DisconnectCategory::NonRecoverable),
    (PACKET_TOO_LARGE, DisconnectCategory::NonRecoverable),
    (MESSAGE_RATE_TOO_HIGH, DisconnectCategory::NonRecoverable),
    (QUOTA_EXCEEDED, DisconnectCategory::NonRecoverable),
    (ADMINISTRATIVE_ACTION, DisconnectCategory::NonRecoverable),
    (PAYLOAD_FORMAT_INVALID, DisconnectCategory::NonRecoverable),
    (RETAIN_NOT_SUPPORTED, DisconnectCategory::NonRecoverable),
    (QOS_NOT_SUPPORTED, DisconnectCategory::NonRecoverable),
    (SHARED_SUBSCRIPTIONS_NOT_SUPPORTED, DisconnectCategory::NonRecoverable),
    (CONNECTION_RATE_EXCEEDED, DisconnectCategory::NonRecoverable),
    (MAXIMUM_CONNECT_TIME, DisconnectCategory::NonRecoverable),
    (SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED, DisconnectCategory::NonRecoverable),
    (WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED, DisconnectCategory::NonRecoverable),
];

/// Classify a reason code; codes outside the table are `Other`
pub fn classify(reason_code: u8) -> DisconnectCategory {
    CLASSIFICATION
        .iter()
        .find(|(code, _)| *code == reason_code)
        .map(|(_, category)| *category)
        .unwrap_or(DisconnectCategory::Other)
}

/// Human readable name of an MQTT v5 reason code
pub fn reason_code_str(reason_code: u8) -> &'static str {
    match reason_code {
        NORMAL_DISCONNECTION => "Success / Normal disconnection",
        DISCONNECT_WITH_WILL_MESSAGE => "Disconnect with Will Message",
        UNSPECIFIED_ERROR => "Unspecified error",
        MALFORMED_PACKET => "Malformed Packet",
        PROTOCOL_ERROR => "Protocol Error",
        IMPLEMENTATION_SPECIFIC_ERROR => "Implementation specific error",
        UNSUPPORTED_PROTOCOL_VERSION => "Unsupported Protocol Version",
        CLIENT_IDENTIFIER_NOT_VALID => "Client Identifier not valid",
        BAD_USER_NAME_OR_PASSWORD => "Bad User Name or Password",
        NOT_AUTHORIZED => "Not authorized",
        SERVER_UNAVAILABLE => "Server unavailable",
        SERVER_BUSY => "Server busy",
        BANNED => "Banned",
        SERVER_SHUTTING_DOWN => "Server shutting down",
        BAD_AUTHENTICATION_METHOD => "Bad authentication method",
        KEEP_ALIVE_TIMEOUT => "Keep Alive timeout",
        SESSION_TAKEN_OVER => "Session taken over",
        TOPIC_FILTER_INVALID => "Topic Filter invalid",
        TOPIC_NAME_INVALID => "Topic Name invalid",
        RECEIVE_MAXIMUM_EXCEEDED => "Receive Maximum exceeded",
        TOPIC_ALIAS_INVALID => "Topic Alias invalid",
        PACKET_TOO_LARGE => "Packet too large",
        MESSAGE_RATE_TOO_HIGH => "Message rate too high",
        QUOTA_EXCEEDED => "Quota exceeded",
        ADMINISTRATIVE_ACTION => "Administrative action",
        PAYLOAD_FORMAT_INVALID => "Payload format invalid",
        RETAIN_NOT_SUPPORTED => "Retain not supported",
        QOS_NOT_SUPPORTED => "QoS not supported",
        USE_ANOTHER_SERVER => "Use another server",
        SERVER_MOVED => "Server moved",
        SHARED_SUBSCRIPTIONS_NOT_SUPPORTED => "Shared Subscriptions not supported",
        CONNECTION_RATE_EXCEEDED => "Connection rate exceeded",
        MAXIMUM_CONNECT_TIME => "Maximum connect time",
        SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED => "Subscription Identifiers not supported",
        WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED => "Wildcard Subscriptions not supported",
        _ => "Unknown reason code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_codes() {
        for code in [0x00, 0x04, 0x80, 0x89, 0x8D, 0x9C, 0x9D] {
            assert_eq!(classify(code), DisconnectCategory::Transient, "code {code:#04x}");
        }
    }

    #[test]
    fn test_non_recoverable_codes() {
        for code in [
            0x81, 0x82, 0x83, 0x87, 0x8B, 0x8E, 0x8F, 0x90, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98,
            0x99, 0x9A, 0x9B, 0x9E, 0x9F, 0xA0, 0xA1, 0xA2,
        ] {
            assert_eq!(
                classify(code),
                DisconnectCategory::NonRecoverable,
                "code {code:#04x}"
            );
        }
    }

    #[test]
    fn test_unknown_codes_are_other() {
        assert_eq!(classify(0x01), DisconnectCategory::Other);
        assert_eq!(classify(0x86), DisconnectCategory::Other);
        assert_eq!(classify(0xFF), DisconnectCategory::Other);
    }

    #[test]
    fn test_table_has_no_duplicates() {
        for (i, (code, _)) in CLASSIFICATION.iter().enumerate() {
            assert!(
                CLASSIFICATION[i + 1..].iter().all(|(other, _)| other != code),
                "duplicate entry {code:#04x}"
            );
        }
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(reason_code_str(QUOTA_EXCEEDED), "Quota exceeded");
        assert_eq!(reason_code_str(0x42), "Unknown reason code");
    }
}
