//! Messages exchanged with the boundary.
//!
//! Every envelope is a single JSON object. Requests and responses are
//! correlated by `id`; control messages and push notifications are
//! distinguished by their `cmd` tag.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::VaultCommand;
use crate::error::VaultError;

/// Push notification tag; messages carrying it bypass request correlation.
pub const PASSWORD_UPDATED: &str = "passwordUpdated";

/// Identification and credential sent with the transferred endpoint.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
    pub access_token: String,
}

impl std::fmt::Debug for InitMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitMsg")
            .field("encrypted_id", &self.encrypted_id)
            .field("user_id", &self.user_id)
            .field(
                "encrypted_password",
                &self.encrypted_password.as_ref().map(|_| "<redacted>"),
            )
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Control messages framing the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum ControlMsg {
    /// Boundary to host: the context finished loading.
    Loaded,
    /// Host to boundary: first message, sent with the endpoint.
    Init(InitMsg),
}

impl ControlMsg {
    pub fn to_json(&self) -> Result<String, VaultError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, VaultError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// The boundary's sole reply to `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMsg {
    pub ok: bool,
}

impl AckMsg {
    pub fn to_json(&self) -> Result<String, VaultError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, VaultError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A command plus its correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultRequest {
    pub id: String,
    pub command: VaultCommand,
}

impl VaultRequest {
    pub fn new(id: impl Into<String>, command: VaultCommand) -> Self {
        Self {
            id: id.into(),
            command,
        }
    }

    pub fn to_value(&self) -> Result<Value, VaultError> {
        let mut value = serde_json::to_value(&self.command)?;
        match &mut value {
            Value::Object(map) => {
                map.insert("id".into(), Value::String(self.id.clone()));
                Ok(value)
            }
            other => Err(VaultError::Protocol(format!(
                "command serialized to a non-object: {other}"
            ))),
        }
    }

    pub fn to_json(&self) -> Result<String, VaultError> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, VaultError> {
        let mut value: Value = serde_json::from_str(raw)?;
        let id = take_id(&mut value)?;
        let command = serde_json::from_value(value)?;
        Ok(Self { id, command })
    }
}

/// What the boundary sent back for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Success(Map<String, Value>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultResponse {
    pub id: String,
    pub body: ResponseBody,
}

impl VaultResponse {
    /// Build a success response from any serializable result shape.
    pub fn success<T: Serialize>(id: impl Into<String>, result: &T) -> Result<Self, VaultError> {
        let fields = match serde_json::to_value(result)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(VaultError::Protocol(format!(
                    "result serialized to a non-object: {other}"
                )));
            }
        };
        Ok(Self {
            id: id.into(),
            body: ResponseBody::Success(fields),
        })
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: ResponseBody::Error(error.into()),
        }
    }

    pub fn from_value(mut value: Value) -> Result<Self, VaultError> {
        let id = take_id(&mut value)?;
        let Value::Object(mut fields) = value else {
            return Err(VaultError::Protocol("response is not an object".into()));
        };
        let body = match fields.remove("error") {
            Some(Value::Null) | None => ResponseBody::Success(fields),
            Some(Value::String(error)) => ResponseBody::Error(error),
            Some(other) => ResponseBody::Error(other.to_string()),
        };
        Ok(Self { id, body })
    }

    pub fn to_json(&self) -> Result<String, VaultError> {
        let mut map = match &self.body {
            ResponseBody::Success(fields) => fields.clone(),
            ResponseBody::Error(error) => {
                let mut map = Map::new();
                map.insert("error".into(), Value::String(error.clone()));
                map
            }
        };
        map.insert("id".into(), Value::String(self.id.clone()));
        Ok(serde_json::to_string(&Value::Object(map))?)
    }

    /// Decode the success fields into `T`, or surface the boundary's error
    /// verbatim.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, VaultError> {
        match self.body {
            ResponseBody::Success(fields) => Ok(serde_json::from_value(Value::Object(fields))?),
            ResponseBody::Error(error) => Err(VaultError::Vault(error)),
        }
    }
}

/// Unsolicited notification from the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VaultEvent {
    /// Key material was re-wrapped inside the boundary.
    PasswordUpdated { encrypted_password: String },
}

impl VaultEvent {
    pub fn to_json(&self) -> Result<String, VaultError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A message arriving on the host's endpoint after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Event(VaultEvent),
    Response(VaultResponse),
}

impl Inbound {
    /// Classify a raw message. The push tag is checked first so that a
    /// notification is never mistaken for a response.
    pub fn parse(raw: &str) -> Result<Self, VaultError> {
        let value: Value = serde_json::from_str(raw)?;
        if value.get("cmd").and_then(Value::as_str) == Some(PASSWORD_UPDATED) {
            return Ok(Inbound::Event(serde_json::from_value(value)?));
        }
        Ok(Inbound::Response(VaultResponse::from_value(value)?))
    }
}

fn take_id(value: &mut Value) -> Result<String, VaultError> {
    match value.as_object_mut().and_then(|map| map.remove("id")) {
        Some(Value::String(id)) => Ok(id),
        Some(other) => Err(VaultError::Protocol(format!("non-string id: {other}"))),
        None => Err(VaultError::Protocol("message has no id".into())),
    }
}
