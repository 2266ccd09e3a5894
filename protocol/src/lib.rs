use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Inbound `type` asking the tunnel to list the project's agents.
pub const AGENT_DISCOVERY_TYPE: &str = "getAgents";
/// Trigger attached to every invocation coming from the console.
pub const MANUAL_TRIGGER: &str = "manual";

pub const TYPE_LOG: &str = "log";
pub const TYPE_SESSION_EVENT: &str = "session_event";
pub const TYPE_AGENTS: &str = "agents";
pub const TYPE_OUTPUT: &str = "output";

/// Unit exchanged with the relay. `id` is always the session identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub r#type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(id: impl Into<String>, r#type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            r#type: r#type.into(),
            payload,
        }
    }
}

#[derive(Deserialize)]
struct Discriminator {
    #[serde(default)]
    r#type: String,
}

#[derive(Deserialize)]
struct InvocationFrame {
    payload: SessionInvocation,
}

/// What an inbound relay frame asks the tunnel to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    AgentDiscovery,
    Invocation(SessionInvocation),
}

impl Inbound {
    /// Decodes the discriminator first and only then the full invocation shape.
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        let disc: Discriminator = serde_json::from_str(frame)?;
        if disc.r#type == AGENT_DISCOVERY_TYPE {
            return Ok(Self::AgentDiscovery);
        }
        let full: InvocationFrame = serde_json::from_str(frame)?;
        Ok(Self::Invocation(full.payload))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInvocation {
    pub session_id: String,
    #[serde(default)]
    pub trigger: String,
    pub agent_id: String,
    #[serde(default)]
    pub content_type: String,
    /// Base64 of the raw request body.
    #[serde(default)]
    pub payload: String,
}

impl SessionInvocation {
    pub fn decode_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.payload.as_bytes())
    }

    /// Builds the body posted to the local agent server. Decodes the payload once.
    pub fn to_request(&self) -> Result<InvocationRequest, base64::DecodeError> {
        Ok(InvocationRequest {
            session_id: self.session_id.clone(),
            content_type: self.content_type.clone(),
            payload: self.decode_payload()?,
            trigger: MANUAL_TRIGGER.to_string(),
        })
    }
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

/// JSON body of `POST http://localhost:{port}/{agentId}`. The payload bytes travel
/// base64-encoded, which is how byte slices are represented in JSON for the agent SDK.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub session_id: String,
    pub content_type: String,
    #[serde(serialize_with = "serialize_base64")]
    pub payload: Vec<u8>,
    pub trigger: String,
}

/// Response body shape expected from the local agent server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPayload {
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub payload: String,
}

/// Payload of an outbound `output` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMessage {
    pub session_id: String,
    pub content_type: String,
    pub payload: String,
}

impl OutputMessage {
    pub fn new(session_id: impl Into<String>, output: OutputPayload) -> Self {
        Self {
            session_id: session_id.into(),
            content_type: output.content_type,
            payload: output.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentsPayload {
    pub agents: Vec<AgentInfo>,
}

/// Maps a local event record's `command` to the outbound envelope type.
pub fn event_type_for_command(command: &str) -> &str {
    if command == "event" {
        TYPE_SESSION_EVENT
    } else {
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn discovery_is_decided_by_type_alone() {
        let frame = r#"{"id":"s1","type":"getAgents"}"#;
        assert_eq!(Inbound::decode(frame).unwrap(), Inbound::AgentDiscovery);
    }

    #[test]
    fn invocation_frame_decodes_payload() {
        let frame = r#"{"id":"s1","type":"input","payload":{"sessionId":"s1","agentId":"a1","contentType":"application/json","payload":"eyJoZWxsbyI6IndvcmxkIn0="}}"#;
        let Inbound::Invocation(inv) = Inbound::decode(frame).unwrap() else {
            panic!("expected invocation");
        };
        assert_eq!(inv.session_id, "s1");
        assert_eq!(inv.agent_id, "a1");
        assert_eq!(inv.decode_payload().unwrap(), br#"{"hello":"world"}"#);
    }

    #[test]
    fn invocation_without_session_id_is_rejected() {
        let frame = r#"{"id":"s1","type":"input","payload":{"agentId":"a1"}}"#;
        assert!(Inbound::decode(frame).is_err());
        assert!(Inbound::decode("not json").is_err());
    }

    #[test]
    fn payload_decoding_is_pure() {
        let inv = SessionInvocation {
            session_id: "s1".into(),
            trigger: String::new(),
            agent_id: "a1".into(),
            content_type: "text/plain".into(),
            payload: BASE64.encode(b"\x00\xffhello"),
        };
        assert_eq!(inv.decode_payload().unwrap(), inv.decode_payload().unwrap());

        let bad = SessionInvocation {
            payload: "***".into(),
            ..inv
        };
        assert!(bad.to_request().is_err());
    }

    #[test]
    fn request_carries_manual_trigger_and_reencodes_bytes() {
        let inv = SessionInvocation {
            session_id: "s1".into(),
            trigger: "webhook".into(),
            agent_id: "a1".into(),
            content_type: "application/json".into(),
            payload: "eyJoZWxsbyI6IndvcmxkIn0=".into(),
        };
        let req = inv.to_request().unwrap();
        assert_eq!(req.trigger, MANUAL_TRIGGER);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "sessionId": "s1",
                "contentType": "application/json",
                "payload": "eyJoZWxsbyI6IndvcmxkIn0=",
                "trigger": "manual"
            })
        );
    }

    #[test]
    fn output_payload_tolerates_missing_fields() {
        let out: OutputPayload = serde_json::from_str(r#"{"payload":"hi"}"#).unwrap();
        assert_eq!(out.content_type, "");
        assert!(serde_json::from_str::<OutputPayload>("[1,2]").is_err());

        let msg = OutputMessage::new("s1", out);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "sessionId": "s1", "contentType": "", "payload": "hi" })
        );
    }

    #[test]
    fn event_command_is_renamed() {
        assert_eq!(event_type_for_command("event"), TYPE_SESSION_EVENT);
        assert_eq!(event_type_for_command("metric"), "metric");
    }
}
