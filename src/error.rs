use crate::ids::LimitId;
use crate::registry::RegistryError;
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type ParseFailure = Box<dyn std::error::Error + Send + Sync>;

/// Taxonomy tag carried by every [`QueryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputValidation,
    RateLimitPrevention,
    ProviderRateLimitViolated,
    Unauthorized,
    RequestOutdated,
    ProviderInternalError,
    UnknownResponseFormat,
    DomainInputError,
    Other,
    Cancelled,
    Disposed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InputValidation => "input_validation",
            ErrorKind::RateLimitPrevention => "rate_limit_prevention",
            ErrorKind::ProviderRateLimitViolated => "provider_rate_limit_violated",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::RequestOutdated => "request_outdated",
            ErrorKind::ProviderInternalError => "provider_internal_error",
            ErrorKind::UnknownResponseFormat => "unknown_response_format",
            ErrorKind::DomainInputError => "domain_input_error",
            ErrorKind::Other => "other",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Disposed => "disposed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side validation failures, from the secondary code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainInputReason {
    IllegalCharacters,
    TooManyParameters,
    MandatoryParameterMissing,
    UnknownParameter,
    UnreadParameters,
    ParameterEmpty,
    ParameterNotRequired,
    BadPrecision,
    TimeInForceNotRequired,
    InvalidTimeInForce,
    InvalidOrderType,
    InvalidSide,
    InvalidSymbol,
    InvalidListenKey,
    InvalidParameter,
    NewOrderRejected,
    CancelRejected,
    NoSuchOrder,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InputValidation(String),

    #[error("query would exceed rate limit {limit_id}; not sent")]
    RateLimitPrevention { limit_id: LimitId },

    #[error("{kind} (code {code}): {message}")]
    Provider {
        kind: ErrorKind,
        code: i64,
        message: String,
        reason: Option<DomainInputReason>,
    },

    #[error("unknown response format: {source}")]
    UnknownResponseFormat {
        #[source]
        source: ParseFailure,
    },

    #[error("request failed (status {status:?}): {content}")]
    Other { status: Option<u16>, content: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("query cancelled")]
    Cancelled,

    #[error("client has been shut down")]
    Disposed,
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::InputValidation(_) => ErrorKind::InputValidation,
            QueryError::RateLimitPrevention { .. } => ErrorKind::RateLimitPrevention,
            QueryError::Provider { kind, .. } => *kind,
            QueryError::UnknownResponseFormat { .. } => ErrorKind::UnknownResponseFormat,
            QueryError::Other { .. } | QueryError::Transport(_) => ErrorKind::Other,
            QueryError::Cancelled => ErrorKind::Cancelled,
            QueryError::Disposed => ErrorKind::Disposed,
        }
    }

    /// Provider error code, when the service returned one.
    pub fn code(&self) -> Option<i64> {
        match self {
            QueryError::Provider { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<RegistryError> for QueryError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Closed => QueryError::Disposed,
            RegistryError::UnknownLimit(id) => {
                QueryError::InputValidation(format!("unknown rate limit {}", id))
            }
        }
    }
}

/// Primary code table. `None` means the code is not a general provider error.
pub fn classify_code(code: i64) -> Option<ErrorKind> {
    let kind = match code {
        -1002 | -2014 | -2015 => ErrorKind::Unauthorized,
        -1003 | -1015 => ErrorKind::ProviderRateLimitViolated,
        -1021 => ErrorKind::RequestOutdated,
        -1000 | -1001 | -1006 | -1007 => ErrorKind::ProviderInternalError,
        _ => return None,
    };
    Some(kind)
}

/// Secondary code table for request validation failures.
pub fn domain_input_reason(code: i64) -> Option<DomainInputReason> {
    use DomainInputReason::*;
    let reason = match code {
        -1100 => IllegalCharacters,
        -1101 => TooManyParameters,
        -1102 => MandatoryParameterMissing,
        -1103 => UnknownParameter,
        -1104 => UnreadParameters,
        -1105 => ParameterEmpty,
        -1106 => ParameterNotRequired,
        -1111 => BadPrecision,
        -1114 => TimeInForceNotRequired,
        -1115 => InvalidTimeInForce,
        -1116 => InvalidOrderType,
        -1117 => InvalidSide,
        -1121 => InvalidSymbol,
        -1125 => InvalidListenKey,
        -1130 => InvalidParameter,
        -2010 => NewOrderRejected,
        -2011 => CancelRejected,
        -2013 => NoSuchOrder,
        _ => return None,
    };
    Some(reason)
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Translate the body of an unsuccessful response into a [`QueryError`].
pub fn map_error_response(status: Option<u16>, content: &[u8]) -> QueryError {
    let raw = String::from_utf8_lossy(content).into_owned();
    let Ok(payload) = serde_json::from_slice::<ErrorPayload>(content) else {
        return QueryError::Other {
            status,
            content: raw,
        };
    };
    if let Some(kind) = classify_code(payload.code) {
        return QueryError::Provider {
            kind,
            code: payload.code,
            message: payload.msg,
            reason: None,
        };
    }
    if let Some(reason) = domain_input_reason(payload.code) {
        return QueryError::Provider {
            kind: ErrorKind::DomainInputError,
            code: payload.code,
            message: payload.msg,
            reason: Some(reason),
        };
    }
    QueryError::Other {
        status,
        content: raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(body: &str) -> ErrorKind {
        map_error_response(Some(400), body.as_bytes()).kind()
    }

    #[test]
    fn error_mapping_matrix() {
        assert_eq!(kind_of(r#"{"code":-1002,"msg":"no"}"#), ErrorKind::Unauthorized);
        assert_eq!(kind_of(r#"{"code":-2015,"msg":"bad key"}"#), ErrorKind::Unauthorized);
        assert_eq!(
            kind_of(r#"{"code":-1003,"msg":"Too much request weight used"}"#),
            ErrorKind::ProviderRateLimitViolated
        );
        assert_eq!(kind_of(r#"{"code":-1021,"msg":"late"}"#), ErrorKind::RequestOutdated);
        assert_eq!(kind_of(r#"{"code":-1001,"msg":"x"}"#), ErrorKind::ProviderInternalError);
        assert_eq!(kind_of(r#"{"code":-1121,"msg":"Invalid symbol."}"#), ErrorKind::DomainInputError);
        assert_eq!(kind_of(r#"{"code":-9999,"msg":"?"}"#), ErrorKind::Other);
        assert_eq!(kind_of("<html>bad gateway</html>"), ErrorKind::Other);
    }

    #[test]
    fn domain_errors_carry_reason_and_message() {
        let err = map_error_response(Some(400), br#"{"code":-1102,"msg":"Mandatory parameter 'symbol' was not sent"}"#);
        match err {
            QueryError::Provider {
                kind,
                code,
                message,
                reason,
            } => {
                assert_eq!(kind, ErrorKind::DomainInputError);
                assert_eq!(code, -1102);
                assert!(message.contains("symbol"));
                assert_eq!(reason, Some(DomainInputReason::MandatoryParameterMissing));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unmapped_payload_keeps_raw_content() {
        let err = map_error_response(Some(502), b"upstream down");
        assert_eq!(err.code(), None);
        match err {
            QueryError::Other { status, content } => {
                assert_eq!(status, Some(502));
                assert_eq!(content, "upstream down");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn registry_errors_convert() {
        assert_eq!(QueryError::from(RegistryError::Closed).kind(), ErrorKind::Disposed);
    }
}
