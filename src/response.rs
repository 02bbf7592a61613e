//! Interprets a successful transport outcome: JSON parsing, domain-error
//! detection, and HTTP-status classification.

use crate::error::{ArangoError, PoolError, Result};
use crate::transport::TransportResponse;

/// The body a caller ultimately sees, after content-type sniffing.
#[derive(Debug, Clone)]
pub enum ResponseEnvelope {
    Json(serde_json::Value),
    Raw(Vec<u8>),
}

impl ResponseEnvelope {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseEnvelope::Json(v) => Some(v),
            ResponseEnvelope::Raw(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ResponseEnvelope::Raw(b) => Some(b),
            ResponseEnvelope::Json(_) => None,
        }
    }
}

/// Content-type main/subtype sniffing equivalent to `/\/(json|javascript)(\W|$)/`
/// against the subtype, without pulling in a regex dependency.
fn is_json_like_content_type(content_type: &str) -> bool {
    let Some((_main, rest)) = content_type.split_once('/') else {
        return false;
    };
    let subtype = rest.split(';').next().unwrap_or("").trim();
    for candidate in ["json", "javascript"] {
        if let Some(tail) = subtype.strip_prefix(candidate) {
            if tail.is_empty() || !tail.chars().next().unwrap().is_alphanumeric() {
                return true;
            }
        }
    }
    false
}

/// Applies the response-interpretation stage described for the dispatcher: on
/// a non-redirected transport success, parse JSON bodies, detect the
/// structured domain-error envelope, and classify HTTP errors. Never invoked
/// for a 503 carrying `x-arango-endpoint` — that case is handled by the
/// dispatcher itself as a redirect, before this function is reached.
pub fn interpret(response: TransportResponse, expect_binary: bool) -> Result<(u16, ResponseEnvelope)> {
    let content_type = response
        .headers
        .get("content-type")
        .map(String::as_str)
        .unwrap_or("");

    let envelope = if is_json_like_content_type(content_type) && !response.body.is_empty() {
        match serde_json::from_slice::<serde_json::Value>(&response.body) {
            Ok(value) => ResponseEnvelope::Json(value),
            Err(_) if expect_binary => ResponseEnvelope::Raw(response.body),
            Err(source) => {
                let partial_text = String::from_utf8_lossy(&response.body).into_owned();
                return Err(PoolError::Parse {
                    source,
                    raw: response.body,
                    partial_text,
                });
            }
        }
    } else {
        ResponseEnvelope::Raw(response.body)
    };

    if let ResponseEnvelope::Json(value) = &envelope {
        if is_arango_error_envelope(value) {
            let arango_error: ArangoError = serde_json::from_value(value.clone())?;
            return Err(PoolError::Arango(arango_error));
        }
    }

    if response.status >= 400 {
        let body = match &envelope {
            ResponseEnvelope::Json(v) => v.to_string(),
            ResponseEnvelope::Raw(b) => String::from_utf8_lossy(b).into_owned(),
        };
        return Err(PoolError::Http {
            status: response.status,
            body,
        });
    }

    Ok((response.status, envelope))
}

fn is_arango_error_envelope(value: &serde_json::Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    ["error", "code", "errorMessage", "errorNum"]
        .iter()
        .all(|key| obj.contains_key(*key))
}
