use serde::Serialize;
use serde_json::Value;

use crate::GatewayError;

/// Information about an authenticated client, as returned by the remote authenticator.
///
/// The full metadata is a JSON object that is forwarded to the remote authorizer unchanged. Its
/// `public` member, if any, may be exposed to backends and logs. Its `tracing_attributes` member,
/// if any, must be an object of scalar values that are attached to the request span.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AuthenticationMetadata {
    full: Value,
}

impl AuthenticationMetadata {
    /// Validates metadata received from a remote service.
    pub fn from_value(full: Value) -> Result<Self, GatewayError> {
        let object = match &full {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            other => {
                return Err(GatewayError::InvalidArgument(format!(
                    "Authentication metadata must be an object, not {}",
                    json_type(other)
                )));
            }
        };

        if let Some(attributes) = object.get("tracing_attributes") {
            let Value::Object(attributes) = attributes else {
                return Err(GatewayError::InvalidArgument(
                    "Tracing attributes must be an object".into(),
                ));
            };
            for (key, value) in attributes {
                if matches!(value, Value::Array(_) | Value::Object(_) | Value::Null) {
                    return Err(GatewayError::InvalidArgument(format!(
                        "Tracing attribute {key:?} has unsupported type {}",
                        json_type(value)
                    )));
                }
            }
        }

        Ok(Self { full })
    }

    /// Metadata of a client that was not authenticated remotely.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn full(&self) -> &Value {
        &self.full
    }

    pub fn public(&self) -> Option<&Value> {
        self.full.get("public")
    }

    /// Scalar attributes to attach to traces, rendered as strings.
    pub fn tracing_attributes(&self) -> impl Iterator<Item = (&str, String)> {
        self.full
            .get("tracing_attributes")
            .and_then(Value::as_object)
            .into_iter()
            .flatten()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.as_str(), value)
            })
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
