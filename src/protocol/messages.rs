use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{EndpointId, RequestId};
use crate::error::{Result, TunnelError};

pub const CONTENT_LENGTH: &str = "Content-Length";

/// Control frame telling the client where its public URL now resolves
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointAnnouncement {
    pub endpoint: EndpointId,
}

/// One header's value(s). The relay sends lists; a single string is accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            HeaderValues::One(v) => std::slice::from_ref(v),
            HeaderValues::Many(vs) => vs,
        };
        values.iter().map(String::as_str)
    }
}

/// An HTTP request the relay received on our public endpoint.
///
/// Only `uuid` is required. The other fields are read leniently: a value
/// of the wrong JSON type decodes as absent rather than failing the frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxiedRequest {
    pub uuid: RequestId,
    #[serde(default, deserialize_with = "lenient_string")]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub path: Option<String>,
    #[serde(default, deserialize_with = "lenient_headers")]
    pub headers: BTreeMap<String, HeaderValues>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub body_base64: Option<String>,
    /// Fields this client doesn't interpret, kept for handlers
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ProxiedRequest {
    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("GET")
    }

    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("/")
    }

    /// Flattened `(name, value)` pairs, one per header value
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.clone(), v.to_string())))
            .collect()
    }

    /// Raw request body; empty when the relay sent none
    pub fn body(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        match self.body_base64.as_deref() {
            None | Some("") => Ok(Vec::new()),
            Some(encoded) => base64::engine::general_purpose::STANDARD.decode(encoded),
        }
    }
}

/// Frames the relay pushes to the client.
///
/// A non-empty string `endpoint` makes a frame an announcement, even when
/// it also carries a `uuid`. Otherwise a string `uuid` makes it a request.
/// Objects with neither fail to decode.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Announcement(EndpointAnnouncement),
    Request(ProxiedRequest),
}

impl InboundFrame {
    /// Decode a frame from raw WebSocket payload bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| TunnelError::Decode(format!("frame is not UTF-8: {}", e)))?;
        Self::from_json(text)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| TunnelError::Decode(format!("frame is not JSON: {}", e)))?;

        let Value::Object(fields) = &value else {
            return Err(TunnelError::Decode("frame is not a JSON object".to_string()));
        };

        let announces = fields
            .get("endpoint")
            .and_then(Value::as_str)
            .is_some_and(|endpoint| !endpoint.is_empty());
        if announces {
            return serde_json::from_value(value)
                .map(InboundFrame::Announcement)
                .map_err(|e| TunnelError::Decode(format!("bad announcement: {}", e)));
        }

        if !fields.get("uuid").is_some_and(Value::is_string) {
            return Err(TunnelError::Decode(
                "frame has neither a non-empty string 'endpoint' nor a string 'uuid'".to_string(),
            ));
        }

        serde_json::from_value(value)
            .map(InboundFrame::Request)
            .map_err(|e| TunnelError::Decode(format!("bad request: {}", e)))
    }
}

/// How response header values are laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderStyle {
    /// `{"Name": "value"}`, repeated values joined with ", "
    #[default]
    Single,
    /// `{"Name": ["value", ...]}`
    List,
}

/// Response frame sent back for one proxied request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxiedResponse {
    pub uuid: RequestId,
    pub status: u16,
    pub headers: BTreeMap<String, HeaderValues>,
    pub body_base64: String,
}

impl ProxiedResponse {
    /// Build a response frame. `Content-Length` always reflects `body`,
    /// replacing whatever the handler supplied.
    pub fn new(
        uuid: RequestId,
        status: u16,
        headers: Vec<(String, String)>,
        body: &[u8],
        style: HeaderStyle,
    ) -> Self {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
                continue;
            }
            grouped.entry(name).or_default().push(value);
        }
        grouped.insert(CONTENT_LENGTH.to_string(), vec![body.len().to_string()]);

        let headers = grouped
            .into_iter()
            .map(|(name, values)| {
                let values = match style {
                    HeaderStyle::Single => HeaderValues::One(values.join(", ")),
                    HeaderStyle::List => HeaderValues::Many(values),
                };
                (name, values)
            })
            .collect();

        ProxiedResponse {
            uuid,
            status,
            headers,
            body_base64: base64::engine::general_purpose::STANDARD.encode(body),
        }
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.iter().next())
            .and_then(|v| v.parse().ok())
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(Some(s)),
        _ => Ok(None),
    }
}

/// Header map that tolerates scalar values and skips anything unusable
fn lenient_headers<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, HeaderValues>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::Object(fields) = Value::deserialize(deserializer)? else {
        return Ok(BTreeMap::new());
    };

    Ok(fields
        .into_iter()
        .filter_map(|(name, value)| {
            let values = match value {
                Value::Array(items) => {
                    HeaderValues::Many(items.into_iter().filter_map(header_scalar).collect())
                }
                other => HeaderValues::One(header_scalar(other)?),
            };
            Some((name, values))
        })
        .collect())
}

fn header_scalar(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_announcement() {
        let frame = InboundFrame::from_json(r#"{"endpoint":"abc123"}"#).unwrap();
        match frame {
            InboundFrame::Announcement(a) => assert_eq!(a.endpoint.0, "abc123"),
            other => panic!("expected announcement, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_relay_request() {
        let json = r#"{
            "uuid": "5f1c",
            "method": "POST",
            "path": "/abc123/items",
            "headers": {"Content-Type": ["application/json"], "Accept": ["a", "b"]},
            "body_base64": "eyJrIjoxfQ=="
        }"#;

        let InboundFrame::Request(req) = InboundFrame::from_json(json).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.uuid, RequestId::from("5f1c"));
        assert_eq!(req.method(), "POST");
        assert_eq!(req.path(), "/abc123/items");
        assert_eq!(req.body().unwrap(), br#"{"k":1}"#.to_vec());
        assert_eq!(
            req.header_pairs(),
            vec![
                ("Accept".to_string(), "a".to_string()),
                ("Accept".to_string(), "b".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ]
        );
    }

    #[test]
    fn test_decode_minimal_request_keeps_unknown_fields() {
        let json = r#"{"uuid":"r-1","headers":null,"trace":"x"}"#;
        let InboundFrame::Request(req) = InboundFrame::from_json(json).unwrap() else {
            panic!("expected request");
        };
        assert!(req.headers.is_empty());
        assert!(req.body().unwrap().is_empty());
        assert_eq!(req.method(), "GET");
        assert_eq!(req.extra.get("trace"), Some(&serde_json::json!("x")));
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        for bad in [
            "not json",
            "[1,2,3]",
            r#"{"method":"GET"}"#,
            r#"{"uuid":42}"#,
            r#"{"endpoint":7}"#,
        ] {
            let err = InboundFrame::from_json(bad).unwrap_err();
            assert!(matches!(err, TunnelError::Decode(_)), "{}: {:?}", bad, err);
        }

        let err = InboundFrame::from_bytes(&[0xff, 0xfe, b'{']).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_odd_field_types_still_decode_as_request() {
        let json = r#"{
            "uuid": "odd",
            "method": 5,
            "path": ["/"],
            "headers": {"X-Num": 1, "X-List": ["a", 2, null], "X-Obj": {}},
            "body_base64": false
        }"#;

        let InboundFrame::Request(req) = InboundFrame::from_json(json).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.uuid, RequestId::from("odd"));
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/");
        assert!(req.body().unwrap().is_empty());
        assert_eq!(
            req.header_pairs(),
            vec![
                ("X-List".to_string(), "a".to_string()),
                ("X-List".to_string(), "2".to_string()),
                ("X-Num".to_string(), "1".to_string()),
            ]
        );

        let InboundFrame::Request(req) =
            InboundFrame::from_json(r#"{"uuid":"h","headers":"nope"}"#).unwrap()
        else {
            panic!("expected request");
        };
        assert!(req.headers.is_empty());
    }

    #[test]
    fn test_endpoint_and_uuid_together() {
        // A usable endpoint wins
        let frame = InboundFrame::from_json(r#"{"endpoint":"abc","uuid":"x"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Announcement(a) if a.endpoint.0 == "abc"));

        // An empty or non-string endpoint falls back to the uuid
        for json in [
            r#"{"endpoint":"","uuid":"x"}"#,
            r#"{"endpoint":7,"uuid":"x"}"#,
            r#"{"endpoint":null,"uuid":"x"}"#,
        ] {
            let frame = InboundFrame::from_json(json).unwrap();
            assert!(
                matches!(&frame, InboundFrame::Request(r) if r.uuid.0 == "x"),
                "{}: {:?}",
                json,
                frame
            );
        }

        let err = InboundFrame::from_json(r#"{"endpoint":""}"#).unwrap_err();
        assert!(matches!(err, TunnelError::Decode(_)));
    }

    #[test]
    fn test_hello_world_response_wire_shape() {
        let resp = ProxiedResponse::new(
            RequestId::from("r-1"),
            200,
            vec![],
            b"Hello World",
            HeaderStyle::Single,
        );

        assert_eq!(
            resp.to_json().unwrap(),
            r#"{"uuid":"r-1","status":200,"headers":{"Content-Length":"11"},"body_base64":"SGVsbG8gV29ybGQ="}"#
        );
    }

    #[test]
    fn test_content_length_overrides_handler_value() {
        let resp = ProxiedResponse::new(
            RequestId::from("x"),
            200,
            vec![
                ("content-length".to_string(), "999".to_string()),
                ("Set-Cookie".to_string(), "a=1".to_string()),
                ("Set-Cookie".to_string(), "b=2".to_string()),
            ],
            &[0u8, 159, 146, 150],
            HeaderStyle::Single,
        );

        assert_eq!(resp.content_length(), Some(4));
        assert!(!resp.headers.contains_key("content-length"));
        assert_eq!(
            resp.headers.get("Set-Cookie"),
            Some(&HeaderValues::One("a=1, b=2".to_string()))
        );
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&resp.body_base64)
            .unwrap();
        assert_eq!(decoded, vec![0u8, 159, 146, 150]);
    }

    #[test]
    fn test_list_header_style() {
        let resp = ProxiedResponse::new(
            RequestId::from("x"),
            201,
            vec![("Vary".to_string(), "Accept".to_string())],
            b"",
            HeaderStyle::List,
        );

        let json: serde_json::Value = serde_json::from_str(&resp.to_json().unwrap()).unwrap();
        assert_eq!(json["headers"]["Vary"], serde_json::json!(["Accept"]));
        assert_eq!(json["headers"]["Content-Length"], serde_json::json!(["0"]));
        assert_eq!(json["body_base64"], "");
        assert_eq!(resp.content_length(), Some(0));
    }
}
