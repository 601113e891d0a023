//! Device update protocol message types
//!
//! Message-type tags carried in the `mt` user property, the result codes
//! carried in responses, and the JSON bodies exchanged with the service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Protocol id carried in the `pid` user property
pub const PROTOCOL_VERSION: &str = "1";
/// Numeric form of [`PROTOCOL_VERSION`]
pub const PROTOCOL_VERSION_NUMBER: i32 = 1;

/// User property names
pub const PROPERTY_MESSAGE_TYPE: &str = "mt";
pub const PROPERTY_PROTOCOL_ID: &str = "pid";
pub const PROPERTY_RESULT_CODE: &str = "resultcode";
pub const PROPERTY_EXTENDED_RESULT_CODE: &str = "extendedresultcode";

/// Content type of every request body
pub const CONTENT_TYPE_JSON: &str = "json";

/// Message-type tags (`mt` user property)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    EnrollmentRequest,
    EnrollmentResponse,
    EnrollmentChangeNotification,
    AgentInfoRequest,
    AgentInfoResponse,
    UpdateAvailableNotification,
    UpdateRequest,
    UpdateResponse,
    UpdateResultRequest,
    UpdateResultResponse,
    UpdateResultAck,
}

impl MessageType {
    pub const ALL: [MessageType; 11] = [
        MessageType::EnrollmentRequest,
        MessageType::EnrollmentResponse,
        MessageType::EnrollmentChangeNotification,
        MessageType::AgentInfoRequest,
        MessageType::AgentInfoResponse,
        MessageType::UpdateAvailableNotification,
        MessageType::UpdateRequest,
        MessageType::UpdateResponse,
        MessageType::UpdateResultRequest,
        MessageType::UpdateResultResponse,
        MessageType::UpdateResultAck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::EnrollmentRequest => "enr_req",
            MessageType::EnrollmentResponse => "enr_resp",
            MessageType::EnrollmentChangeNotification => "enr_cn",
            MessageType::AgentInfoRequest => "ainfo_req",
            MessageType::AgentInfoResponse => "ainfo_resp",
            MessageType::UpdateAvailableNotification => "upd_cn",
            MessageType::UpdateRequest => "upd_req",
            MessageType::UpdateResponse => "upd_resp",
            MessageType::UpdateResultRequest => "updrslt_req",
            MessageType::UpdateResultResponse => "updrslt_resp",
            MessageType::UpdateResultAck => "updrslt_ack",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mt| mt.as_str() == tag)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `resultcode` user property of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseResultCode {
    Success,
    BadRequest,
    Busy,
    Conflict,
    ServerError,
    AgentNotEnrolled,
    /// Any value the agent does not know about
    Unknown(i32),
}

impl ResponseResultCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => ResponseResultCode::Success,
            1 => ResponseResultCode::BadRequest,
            2 => ResponseResultCode::Busy,
            3 => ResponseResultCode::Conflict,
            4 => ResponseResultCode::ServerError,
            5 => ResponseResultCode::AgentNotEnrolled,
            other => ResponseResultCode::Unknown(other),
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            ResponseResultCode::Success => 0,
            ResponseResultCode::BadRequest => 1,
            ResponseResultCode::Busy => 2,
            ResponseResultCode::Conflict => 3,
            ResponseResultCode::ServerError => 4,
            ResponseResultCode::AgentNotEnrolled => 5,
            ResponseResultCode::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for ResponseResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseResultCode::Success => f.write_str("Success"),
            ResponseResultCode::BadRequest => f.write_str("Bad Request"),
            ResponseResultCode::Busy => f.write_str("Busy"),
            ResponseResultCode::Conflict => f.write_str("Conflict"),
            ResponseResultCode::ServerError => f.write_str("Server Error"),
            ResponseResultCode::AgentNotEnrolled => f.write_str("Agent Not Enrolled"),
            ResponseResultCode::Unknown(code) => write!(f, "Unknown ({code})"),
        }
    }
}

/// `extendedresultcode` user property of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedResultCode {
    None,
    UnableToParseMessage,
    MissingOrInvalidValue,
    MissingOrInvalidCorrelationId,
    MissingOrInvalidMessageType,
    MissingOrInvalidProtocolVersion,
    ProtocolVersionMismatch,
    MissingOrInvalidContentType,
    Unknown(i32),
}

impl ExtendedResultCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => ExtendedResultCode::None,
            1 => ExtendedResultCode::UnableToParseMessage,
            2 => ExtendedResultCode::MissingOrInvalidValue,
            3 => ExtendedResultCode::MissingOrInvalidCorrelationId,
            4 => ExtendedResultCode::MissingOrInvalidMessageType,
            5 => ExtendedResultCode::MissingOrInvalidProtocolVersion,
            6 => ExtendedResultCode::ProtocolVersionMismatch,
            7 => ExtendedResultCode::MissingOrInvalidContentType,
            other => ExtendedResultCode::Unknown(other),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExtendedResultCode::None => "None",
            ExtendedResultCode::UnableToParseMessage => "Unable to parse message",
            ExtendedResultCode::MissingOrInvalidValue => "Missing or invalid value",
            ExtendedResultCode::MissingOrInvalidCorrelationId => {
                "Missing or invalid correlation id"
            }
            ExtendedResultCode::MissingOrInvalidMessageType => "Missing or invalid message type",
            ExtendedResultCode::MissingOrInvalidProtocolVersion => {
                "Missing or invalid protocol version"
            }
            ExtendedResultCode::ProtocolVersionMismatch => "Protocol version mismatch",
            ExtendedResultCode::MissingOrInvalidContentType => "Missing or invalid content type",
            ExtendedResultCode::Unknown(_) => "Unknown",
        }
    }
}

/// Validated user properties common to every response message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonResponseProperties {
    pub pid: i32,
    pub result_code: i32,
    pub extended_result_code: i32,
}

impl CommonResponseProperties {
    pub fn result(&self) -> ResponseResultCode {
        ResponseResultCode::from_i32(self.result_code)
    }

    pub fn extended_result(&self) -> ExtendedResultCode {
        ExtendedResultCode::from_i32(self.extended_result_code)
    }

    pub fn is_success(&self) -> bool {
        self.result() == ResponseResultCode::Success
    }
}

/// Body of an `enr_resp` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentResponse {
    #[serde(rename = "IsEnrolled")]
    pub is_enrolled: bool,
    #[serde(rename = "ScopeId")]
    pub scope_id: String,
}

/// Body of an `enr_cn` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentChangeNotification {
    #[serde(rename = "IsEnrolled", default)]
    pub is_enrolled: Option<bool>,
    #[serde(rename = "ScopeId", default)]
    pub scope_id: Option<String>,
}

/// Body of an `ainfo_req` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfoRequest {
    /// Sequence number, the request time in unix seconds
    pub sn: String,
    #[serde(rename = "compatProperties")]
    pub compat_properties: BTreeMap<String, String>,
}

impl AgentInfoRequest {
    pub fn new(now: DateTime<Utc>, manufacturer: &str, model: &str) -> Self {
        let mut compat_properties = BTreeMap::new();
        compat_properties.insert("manufacturer".to_string(), manufacturer.to_string());
        compat_properties.insert("model".to_string(), model.to_string());
        Self {
            sn: now.timestamp().to_string(),
            compat_properties,
        }
    }
}

/// Body of an `updrslt_req` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResultReport {
    pub workflow_id: String,
    pub result_code: i32,
    pub extended_result_codes: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Body of an `upd_resp` message
///
/// Only the workflow identity is interpreted by the agent; the rest of the
/// deployment document is handed to the update processor untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {
    #[serde(default)]
    pub workflow: Option<WorkflowRef>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub id: String,
    #[serde(default)]
    pub action: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_message_type_tags_parse_back() {
        for mt in MessageType::ALL {
            assert_eq!(MessageType::parse(mt.as_str()), Some(mt));
        }
        assert_eq!(MessageType::parse("update_req"), None);
        assert_eq!(MessageType::parse(""), None);
    }

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(ResponseResultCode::from_i32(0), ResponseResultCode::Success);
        assert_eq!(
            ResponseResultCode::from_i32(5),
            ResponseResultCode::AgentNotEnrolled
        );
        assert_eq!(
            ResponseResultCode::from_i32(42),
            ResponseResultCode::Unknown(42)
        );
        assert_eq!(ResponseResultCode::Unknown(42).as_i32(), 42);
        assert_eq!(ResponseResultCode::Busy.to_string(), "Busy");
    }

    #[test]
    fn test_extended_result_code_descriptions() {
        assert_eq!(
            ExtendedResultCode::from_i32(6),
            ExtendedResultCode::ProtocolVersionMismatch
        );
        assert_eq!(ExtendedResultCode::from_i32(99).description(), "Unknown");
    }

    #[test]
    fn test_enrollment_response_field_names() {
        let body: EnrollmentResponse =
            serde_json::from_value(json!({"IsEnrolled": true, "ScopeId": "scope-1"})).unwrap();
        assert!(body.is_enrolled);
        assert_eq!(body.scope_id, "scope-1");

        let missing_scope =
            serde_json::from_value::<EnrollmentResponse>(json!({"IsEnrolled": true}));
        assert!(missing_scope.is_err());
    }

    #[test]
    fn test_agent_info_request_shape() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let body = AgentInfoRequest::new(now, "contoso", "toaster");
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["sn"], json!("1704067200"));
        assert_eq!(value["compatProperties"]["manufacturer"], json!("contoso"));
        assert_eq!(value["compatProperties"]["model"], json!("toaster"));
    }

    #[test]
    fn test_update_response_keeps_unknown_fields() {
        let body: UpdateResponse = serde_json::from_value(json!({
            "workflow": {"id": "wf-1", "action": 3},
            "updateManifest": "{}",
        }))
        .unwrap();

        assert_eq!(body.workflow.as_ref().map(|w| w.id.as_str()), Some("wf-1"));
        assert!(body.rest.contains_key("updateManifest"));
    }
}
