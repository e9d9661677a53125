//! Negotiation response decoding (spec §4.1).
//!
//! The wire format is a flat JSON object discriminated by which keys
//! are present. We model it as a proper sum type rather than a struct
//! of optionals, so that e.g. a `redirection` can never be missing its
//! `url` at the type level once decoded.

use std::fmt;

use serde_json::Value;

use crate::types::{TransferFormat, TransportDescription, TransportKind};

/// A single segment of a [`Path`], identifying either an object key or
/// an array index on the way to a decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// A JSON object key.
    Key(&'static str),
    /// A JSON array index.
    Index(usize),
}

/// The key path leading to a decode error, e.g.
/// `availableTransports[0].transferFormats[1]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path(pub Vec<PathSegment>);

impl Path {
    fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    fn join_key(&self, key: &'static str) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Key(key));
        Self(segments)
    }

    #[must_use]
    fn join_index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        Self(segments)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(key) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{key}")?;
                }
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

/// A structured decode failure for a negotiate response, pinning down
/// both the kind of mismatch and the exact key path at which it
/// occurred (spec §4.1, §8).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiateDecodeError {
    /// The JSON value at `path` was not the expected JSON type.
    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Location of the mismatch.
        path: Path,
        /// The JSON type that was expected.
        expected: &'static str,
        /// A description of the JSON type actually found.
        found: String,
    },
    /// A required key was absent from its containing object.
    #[error("key not found: {key} at {path}")]
    KeyNotFound {
        /// The missing key.
        key: &'static str,
        /// The object in which it was expected.
        path: Path,
    },
    /// A required key was present but held JSON `null`.
    #[error("value not found: {key} at {path} was null")]
    ValueNotFound {
        /// The null-valued key.
        key: &'static str,
        /// The object in which it was found.
        path: Path,
    },
    /// A value decoded to the wrong JSON shape or an unrecognized
    /// enumerated string (e.g. an unknown `TransportKind`).
    #[error("data corrupted at {path}: {message}")]
    DataCorrupted {
        /// Location of the corruption.
        path: Path,
        /// Human-readable description of what was wrong.
        message: String,
    },
}

/// The decoded result of a `/negotiate` request (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationResponse {
    /// The server refused to open a connection.
    Error {
        /// The server-supplied failure message.
        message: String,
    },
    /// The client must retry negotiation at `url`.
    Redirection {
        /// The URL to negotiate against instead.
        url: String,
        /// Bearer token to use for the retried negotiate (and beyond).
        access_token: String,
    },
    /// The legacy (pre-v1) negotiate payload shape.
    PayloadV0 {
        /// The externally visible connection handle.
        connection_id: String,
        /// Transports the server is willing to use.
        available_transports: Vec<TransportDescription>,
    },
    /// The current negotiate payload shape.
    PayloadV1 {
        /// The externally visible connection handle.
        connection_id: String,
        /// The routing key used as the `id` query parameter.
        connection_token: String,
        /// Transports the server is willing to use.
        available_transports: Vec<TransportDescription>,
    },
}

impl NegotiationResponse {
    /// The transports advertised by this response, if any (redirection
    /// and error responses advertise none).
    #[must_use]
    pub fn available_transports(&self) -> Option<&[TransportDescription]> {
        match self {
            Self::PayloadV0 {
                available_transports,
                ..
            }
            | Self::PayloadV1 {
                available_transports,
                ..
            } => Some(available_transports),
            Self::Error { .. } | Self::Redirection { .. } => None,
        }
    }

    /// The value that should be sent as the `id` query parameter when
    /// starting a transport: the connection token for v1 payloads, or
    /// the connection id for v0 payloads (spec §3).
    #[must_use]
    pub fn routing_id(&self) -> Option<&str> {
        match self {
            Self::PayloadV1 {
                connection_token, ..
            } => Some(connection_token),
            Self::PayloadV0 { connection_id, .. } => Some(connection_id),
            Self::Error { .. } | Self::Redirection { .. } => None,
        }
    }
}

fn type_name(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

fn required_string(
    obj: &serde_json::Map<String, Value>,
    key: &'static str,
    path: &Path,
) -> Result<String, NegotiateDecodeError> {
    let value = obj.get(key).ok_or_else(|| NegotiateDecodeError::KeyNotFound {
        key,
        path: path.clone(),
    })?;
    if value.is_null() {
        return Err(NegotiateDecodeError::ValueNotFound {
            key,
            path: path.clone(),
        });
    }
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| NegotiateDecodeError::TypeMismatch {
            path: path.join_key(key),
            expected: "string",
            found: type_name(value),
        })
}

fn required_i64(
    obj: &serde_json::Map<String, Value>,
    key: &'static str,
    path: &Path,
) -> Result<i64, NegotiateDecodeError> {
    let value = obj.get(key).ok_or_else(|| NegotiateDecodeError::KeyNotFound {
        key,
        path: path.clone(),
    })?;
    value
        .as_i64()
        .ok_or_else(|| NegotiateDecodeError::TypeMismatch {
            path: path.join_key(key),
            expected: "int",
            found: type_name(value),
        })
}

fn required_array<'a>(
    obj: &'a serde_json::Map<String, Value>,
    key: &'static str,
    path: &Path,
) -> Result<&'a Vec<Value>, NegotiateDecodeError> {
    let value = obj.get(key).ok_or_else(|| NegotiateDecodeError::KeyNotFound {
        key,
        path: path.clone(),
    })?;
    value
        .as_array()
        .ok_or_else(|| NegotiateDecodeError::TypeMismatch {
            path: path.join_key(key),
            expected: "array",
            found: type_name(value),
        })
}

fn decode_transport_description(
    entry: &Value,
    path: &Path,
) -> Result<TransportDescription, NegotiateDecodeError> {
    let obj = entry
        .as_object()
        .ok_or_else(|| NegotiateDecodeError::TypeMismatch {
            path: path.clone(),
            expected: "object",
            found: type_name(entry),
        })?;

    let kind_str = required_string(obj, "transport", path)?;
    let kind =
        TransportKind::from_wire_str(&kind_str).ok_or_else(|| NegotiateDecodeError::DataCorrupted {
            path: path.join_key("transport"),
            message: format!("invalid TransportKind value \"{kind_str}\""),
        })?;

    let formats_path = path.join_key("transferFormats");
    let formats_raw = required_array(obj, "transferFormats", path)?;
    let mut transfer_formats = Vec::with_capacity(formats_raw.len());
    for (i, raw) in formats_raw.iter().enumerate() {
        let s = raw
            .as_str()
            .ok_or_else(|| NegotiateDecodeError::TypeMismatch {
                path: formats_path.join_index(i),
                expected: "string",
                found: type_name(raw),
            })?;
        let format = TransferFormat::from_wire_str(s).ok_or_else(|| {
            NegotiateDecodeError::DataCorrupted {
                path: formats_path.join_index(i),
                message: format!("invalid TransferFormat value \"{s}\""),
            }
        })?;
        transfer_formats.push(format);
    }

    Ok(TransportDescription::new(kind, transfer_formats))
}

/// Decodes a `/negotiate` response body per spec §4.1.
///
/// Discrimination order: `error` present → error; else `url` present →
/// redirection; else dispatch on `negotiateVersion`.
pub fn decode_negotiation_response(bytes: &[u8]) -> Result<NegotiationResponse, NegotiateDecodeError> {
    let root = Path::root();
    let value: Value = serde_json::from_slice(bytes).map_err(|_| NegotiateDecodeError::TypeMismatch {
        path: root.clone(),
        expected: "object",
        found: "invalid JSON".to_string(),
    })?;

    let obj = value
        .as_object()
        .ok_or_else(|| NegotiateDecodeError::TypeMismatch {
            path: root.clone(),
            expected: "object",
            found: type_name(&value),
        })?;

    if let Some(error_value) = obj.get("error") {
        if let Some(message) = error_value.as_str() {
            return Ok(NegotiationResponse::Error {
                message: message.to_string(),
            });
        }
        // `error` present but not a string is still the error path in
        // spirit, but the type must be reported precisely.
        return Err(NegotiateDecodeError::TypeMismatch {
            path: root.join_key("error"),
            expected: "string",
            found: type_name(error_value),
        });
    }

    if obj.contains_key("url") {
        let url_value = obj.get("url").expect("checked above");
        if url_value.is_null() {
            return Err(NegotiateDecodeError::ValueNotFound {
                key: "url",
                path: root.clone(),
            });
        }
        let url = url_value
            .as_str()
            .ok_or_else(|| NegotiateDecodeError::TypeMismatch {
                path: root.join_key("url"),
                expected: "string",
                found: type_name(url_value),
            })?
            .to_string();
        let access_token = required_string(obj, "accessToken", &root)?;
        return Ok(NegotiationResponse::Redirection { url, access_token });
    }

    let version = required_i64(obj, "negotiateVersion", &root)?;
    let connection_id = required_string(obj, "connectionId", &root)?;

    let transports_path = root.join_key("availableTransports");
    let transports_raw = required_array(obj, "availableTransports", &root)?;
    let mut available_transports = Vec::with_capacity(transports_raw.len());
    for (i, entry) in transports_raw.iter().enumerate() {
        available_transports.push(decode_transport_description(
            entry,
            &transports_path.join_index(i),
        )?);
    }

    if version >= 1 {
        let connection_token = required_string(obj, "connectionToken", &root)?;
        Ok(NegotiationResponse::PayloadV1 {
            connection_id,
            connection_token,
            available_transports,
        })
    } else {
        Ok(NegotiationResponse::PayloadV0 {
            connection_id,
            available_transports,
        })
    }
}
