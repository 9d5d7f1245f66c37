//! 标准错误码：将云厂商错误码与 CLI 退出码归类为统一的错误类别。
//!
//! Canonical classification of remote failures.
//!
//! Cloud control-plane APIs report failures as free-form error codes
//! (`ThrottlingException`, `RequestLimitExceeded`, `AccessDenied`, ...). The
//! engine only needs a handful of decisions from them: may the call be retried,
//! and is the failure the caller's fault or the provider's. This module folds
//! provider codes (and CLI exit codes when no code is available) into a small
//! canonical set.
//!
//! | Prefix | Category    | Description                    |
//! |--------|-------------|--------------------------------|
//! | E1xxx  | client      | Request-side errors            |
//! | E2xxx  | rate        | Throttling and quota errors    |
//! | E3xxx  | server      | Provider-side errors           |
//! | E4xxx  | operational | Lifecycle and state conflicts  |
//! | E9xxx  | unknown     | Catch-all / unclassified       |
//!
//! ## Example
//!
//! ```rust
//! use cloudcall::error_code::StandardErrorCode;
//!
//! let code = StandardErrorCode::from_provider_code("ThrottlingException");
//! assert_eq!(code.code(), "E2001");
//! assert!(code.retryable());
//! assert_eq!(code.category(), "rate");
//! ```

use std::fmt;

/// Canonical error code derived from a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardErrorCode {
    /// E1001: Malformed request, invalid parameters, or missing required fields
    InvalidRequest,
    /// E1002: Missing or expired credentials
    Authentication,
    /// E1003: Valid credentials but insufficient permissions
    PermissionDenied,
    /// E1004: Requested resource does not exist
    NotFound,
    /// E2001: Request rate limit exceeded
    Throttled,
    /// E2002: Account quota or service limit reached
    QuotaExhausted,
    /// E3001: Internal error on the provider side
    ServerError,
    /// E3002: Provider temporarily unavailable
    Unavailable,
    /// E3003: Request timed out before a response was received
    Timeout,
    /// E4001: Resource state conflict (e.g. concurrent modification)
    Conflict,
    /// E4002: Request was cancelled by the caller
    Cancelled,
    /// E9999: Error could not be classified
    Unknown,
}

impl StandardErrorCode {
    /// Returns the canonical code string (e.g. `"E1001"`).
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "E1001",
            Self::Authentication => "E1002",
            Self::PermissionDenied => "E1003",
            Self::NotFound => "E1004",
            Self::Throttled => "E2001",
            Self::QuotaExhausted => "E2002",
            Self::ServerError => "E3001",
            Self::Unavailable => "E3002",
            Self::Timeout => "E3003",
            Self::Conflict => "E4001",
            Self::Cancelled => "E4002",
            Self::Unknown => "E9999",
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Authentication => "authentication",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::Throttled => "throttled",
            Self::QuotaExhausted => "quota_exhausted",
            Self::ServerError => "server_error",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a failure with this code may succeed if the call is repeated.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttled | Self::ServerError | Self::Unavailable | Self::Timeout
        )
    }

    /// Returns `"client"`, `"rate"`, `"server"`, `"operational"` or `"unknown"`.
    #[inline]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidRequest | Self::Authentication | Self::PermissionDenied | Self::NotFound => {
                "client"
            }
            Self::Throttled | Self::QuotaExhausted => "rate",
            Self::ServerError | Self::Unavailable | Self::Timeout => "server",
            Self::Conflict | Self::Cancelled => "operational",
            Self::Unknown => "unknown",
        }
    }

    /// Maps a provider error code to a canonical code.
    ///
    /// Exact aliases are tried first; otherwise common suffix/prefix
    /// conventions are recognised (`*NotFound*`, `Invalid*`, `*Throttl*`).
    pub fn from_provider_code(provider_code: &str) -> Self {
        let exact = match provider_code {
            "Throttling" | "ThrottlingException" | "ThrottledException" | "RequestLimitExceeded"
            | "TooManyRequestsException" | "SlowDown" | "RequestThrottled"
            | "RequestThrottledException" | "PriorRequestNotComplete" => Some(Self::Throttled),
            "LimitExceededException" | "ServiceQuotaExceededException" | "QuotaExceeded" => {
                Some(Self::QuotaExhausted)
            }
            "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation"
            | "AuthorizationError" | "Forbidden" => Some(Self::PermissionDenied),
            "ExpiredToken" | "ExpiredTokenException" | "InvalidClientTokenId"
            | "UnrecognizedClientException" | "AuthFailure" | "MissingAuthenticationToken"
            | "SignatureDoesNotMatch" => Some(Self::Authentication),
            "InternalError" | "InternalFailure" | "InternalServerError" | "ServiceException"
            | "InternalServiceError" => Some(Self::ServerError),
            "ServiceUnavailable" | "ServiceUnavailableException" | "Unavailable" => {
                Some(Self::Unavailable)
            }
            "RequestTimeout" | "RequestTimeoutException" => Some(Self::Timeout),
            "ConflictException" | "ResourceInUseException" | "IncorrectState"
            | "ConcurrentModificationException" | "OperationAbortedException" => Some(Self::Conflict),
            "ValidationError" | "ValidationException" | "MissingParameter"
            | "MalformedQueryString" | "ParamValidation" => Some(Self::InvalidRequest),
            _ => None,
        };
        if let Some(code) = exact {
            return code;
        }
        if provider_code.contains("NotFound") || provider_code.starts_with("NoSuch") {
            Self::NotFound
        } else if provider_code.contains("Throttl") {
            Self::Throttled
        } else if provider_code.starts_with("Invalid") || provider_code.starts_with("Malformed") {
            Self::InvalidRequest
        } else {
            Self::Unknown
        }
    }

    /// Maps a CLI process exit code when stderr carried no provider code.
    ///
    /// Follows the common cloud-CLI convention: 252 is a parameter parsing
    /// failure, 253 a configuration/credential failure, 254 a service error and
    /// 255 an uncategorised failure. A process killed by a signal has no code.
    pub fn from_exit_code(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(2) | Some(252) => Self::InvalidRequest,
            Some(253) => Self::Authentication,
            Some(254) => Self::ServerError,
            Some(130) | None => Self::Cancelled,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for StandardErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_aliases_are_retryable() {
        for code in ["Throttling", "ThrottlingException", "RequestLimitExceeded", "SlowDown"] {
            let std = StandardErrorCode::from_provider_code(code);
            assert_eq!(std, StandardErrorCode::Throttled, "{code}");
            assert!(std.retryable());
        }
    }

    #[test]
    fn heuristic_mapping() {
        assert_eq!(
            StandardErrorCode::from_provider_code("InvalidInstanceID.NotFound"),
            StandardErrorCode::NotFound
        );
        assert_eq!(
            StandardErrorCode::from_provider_code("NoSuchBucket"),
            StandardErrorCode::NotFound
        );
        assert_eq!(
            StandardErrorCode::from_provider_code("InvalidParameterValue"),
            StandardErrorCode::InvalidRequest
        );
        assert_eq!(
            StandardErrorCode::from_provider_code("SomethingNew"),
            StandardErrorCode::Unknown
        );
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!StandardErrorCode::InvalidRequest.retryable());
        assert!(!StandardErrorCode::PermissionDenied.retryable());
        assert_eq!(StandardErrorCode::PermissionDenied.category(), "client");
    }

    #[test]
    fn exit_codes() {
        assert_eq!(
            StandardErrorCode::from_exit_code(Some(252)),
            StandardErrorCode::InvalidRequest
        );
        assert_eq!(
            StandardErrorCode::from_exit_code(Some(254)),
            StandardErrorCode::ServerError
        );
        assert_eq!(StandardErrorCode::from_exit_code(None), StandardErrorCode::Cancelled);
        assert_eq!(StandardErrorCode::ServerError.to_string(), "E3001");
    }
}
