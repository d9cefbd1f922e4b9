//! Collapses heterogeneous backend failures into the stable error taxonomy.
//!
//! Each provider family gets an ordered rule table evaluated top to bottom;
//! the first matching rule wins. A condition matching no rule is logged as a
//! discovery event and answered with the universal fallback; this path never
//! raises further up the stack.

use gcommon::{ErrorCode, ErrorRecord};
use gprovider::{KeyFlag, ProviderError, ProviderFault, ProviderKind};

use crate::GatewayHooks;

/// Fixed safe wording for policy blocks; vendor text is not echoed.
pub const CONTENT_POLICY_MESSAGE: &str =
    "The response was blocked by the provider's content policy. Please rephrase your request.";

/// Universal fallback wording for unclassified failures.
pub const FALLBACK_MESSAGE: &str =
    "The assistant is temporarily unavailable. Please try again in a moment.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedError {
    pub record: ErrorRecord,
    pub key_flag: Option<KeyFlag>,
    /// Whether this condition matched no rule and went through discovery.
    pub discovered: bool,
}

struct Rule {
    code: ErrorCode,
    /// Fixed outward wording; `None` surfaces the vendor's own message.
    message: Option<&'static str>,
    matches: fn(&ProviderError) -> bool,
}

fn status_is(error: &ProviderError, status: u16) -> bool {
    error.status == Some(status)
}

fn message_has(error: &ProviderError, needle: &str) -> bool {
    error.message.to_ascii_lowercase().contains(needle)
}

fn is_quota_exhausted(error: &ProviderError) -> bool {
    (status_is(error, 429) || status_is(error, 402))
        && (message_has(error, "quota") || message_has(error, "billing"))
}

fn is_rate_limited(error: &ProviderError) -> bool {
    status_is(error, 429) || message_has(error, "rate_limit_error")
}

fn is_authentication(error: &ProviderError) -> bool {
    error.fault == ProviderFault::Auth
        || status_is(error, 401)
        || message_has(error, "authentication_error")
}

fn is_permission(error: &ProviderError) -> bool {
    status_is(error, 403) || message_has(error, "permission_error")
}

fn is_unknown_model(error: &ProviderError) -> bool {
    status_is(error, 404) || message_has(error, "not_found_error")
}

fn is_content_policy(error: &ProviderError) -> bool {
    message_has(error, "content_policy")
        || message_has(error, "content management policy")
        || message_has(error, "content filtering policy")
}

fn is_timeout(error: &ProviderError) -> bool {
    error.fault == ProviderFault::Timeout || status_is(error, 408) || status_is(error, 504)
}

fn is_connection(error: &ProviderError) -> bool {
    error.fault == ProviderFault::Connect
}

fn is_vendor_status(error: &ProviderError) -> bool {
    error.fault == ProviderFault::Http && error.status.is_some()
}

fn is_overloaded(error: &ProviderError) -> bool {
    status_is(error, 529) || message_has(error, "overloaded_error")
}

fn is_malformed_reply(error: &ProviderError) -> bool {
    error.fault == ProviderFault::Decode
}

fn is_rejected_request(error: &ProviderError) -> bool {
    error.fault == ProviderFault::InvalidRequest
}

/// OpenAI-compatible family: classification keys off HTTP status codes.
const OPENAI_RULES: &[Rule] = &[
    Rule {
        code: ErrorCode::ContentPolicyViolation,
        message: Some(CONTENT_POLICY_MESSAGE),
        matches: is_content_policy,
    },
    Rule {
        code: ErrorCode::QuotaExceeded,
        message: None,
        matches: is_quota_exhausted,
    },
    Rule {
        code: ErrorCode::RateLimitExceeded,
        message: None,
        matches: is_rate_limited,
    },
    Rule {
        code: ErrorCode::AuthenticationError,
        message: None,
        matches: is_authentication,
    },
    Rule {
        code: ErrorCode::PermissionDenied,
        message: None,
        matches: is_permission,
    },
    Rule {
        code: ErrorCode::ModelNotFound,
        message: None,
        matches: is_unknown_model,
    },
    Rule {
        code: ErrorCode::Timeout,
        message: None,
        matches: is_timeout,
    },
    Rule {
        code: ErrorCode::ConnectionError,
        message: None,
        matches: is_connection,
    },
    Rule {
        code: ErrorCode::StatusError,
        message: None,
        matches: is_vendor_status,
    },
    Rule {
        code: ErrorCode::CommonResponse,
        message: Some(FALLBACK_MESSAGE),
        matches: is_malformed_reply,
    },
    Rule {
        code: ErrorCode::CommonResponse,
        message: Some(FALLBACK_MESSAGE),
        matches: is_rejected_request,
    },
];

/// Anthropic family: in-stream failures carry the vendor's error type string
/// in the message, so classification keys off those alongside statuses.
const ANTHROPIC_RULES: &[Rule] = &[
    Rule {
        code: ErrorCode::ContentPolicyViolation,
        message: Some(CONTENT_POLICY_MESSAGE),
        matches: is_content_policy,
    },
    Rule {
        code: ErrorCode::QuotaExceeded,
        message: None,
        matches: is_quota_exhausted,
    },
    Rule {
        code: ErrorCode::RateLimitExceeded,
        message: None,
        matches: is_rate_limited,
    },
    Rule {
        code: ErrorCode::AuthenticationError,
        message: None,
        matches: is_authentication,
    },
    Rule {
        code: ErrorCode::PermissionDenied,
        message: None,
        matches: is_permission,
    },
    Rule {
        code: ErrorCode::ModelNotFound,
        message: None,
        matches: is_unknown_model,
    },
    Rule {
        code: ErrorCode::StatusError,
        message: None,
        matches: is_overloaded,
    },
    Rule {
        code: ErrorCode::Timeout,
        message: None,
        matches: is_timeout,
    },
    Rule {
        code: ErrorCode::ConnectionError,
        message: None,
        matches: is_connection,
    },
    Rule {
        code: ErrorCode::StatusError,
        message: None,
        matches: is_vendor_status,
    },
    Rule {
        code: ErrorCode::CommonResponse,
        message: Some(FALLBACK_MESSAGE),
        matches: is_malformed_reply,
    },
    Rule {
        code: ErrorCode::CommonResponse,
        message: Some(FALLBACK_MESSAGE),
        matches: is_rejected_request,
    },
];

fn family_rules(provider: Option<ProviderKind>) -> &'static [Rule] {
    match provider {
        Some(ProviderKind::Anthropic) => ANTHROPIC_RULES,
        _ => OPENAI_RULES,
    }
}

/// Which key-health signal a classified failure implies.
pub fn key_flag_for(code: ErrorCode) -> Option<KeyFlag> {
    match code {
        ErrorCode::RateLimitExceeded => Some(KeyFlag::Avoid),
        ErrorCode::AuthenticationError | ErrorCode::PermissionDenied => Some(KeyFlag::Invalid),
        ErrorCode::ModelNotFound => Some(KeyFlag::Deprecated),
        _ => None,
    }
}

pub fn normalize_provider_error(
    error: &ProviderError,
    hooks: &dyn GatewayHooks,
) -> NormalizedError {
    let platform = error.platform();

    for rule in family_rules(error.provider) {
        if (rule.matches)(error) {
            let message = rule
                .message
                .map(str::to_string)
                .unwrap_or_else(|| error.message.clone());
            let mut record = ErrorRecord::new(rule.code, platform, message);
            // Opaque vendor statuses pass through verbatim.
            if rule.code == ErrorCode::StatusError
                && let Some(status) = error.status
            {
                record = record.with_status(status);
            }

            return NormalizedError {
                key_flag: key_flag_for(rule.code),
                record,
                discovered: false,
            };
        }
    }

    tracing::warn!(
        platform,
        fault = ?error.fault,
        status = error.status,
        message = %error.message,
        "new error code discovered"
    );
    hooks.on_unknown_provider_error(platform, &error.message);

    NormalizedError {
        record: ErrorRecord::new(ErrorCode::CommonResponse, platform, FALLBACK_MESSAGE),
        key_flag: None,
        discovered: true,
    }
}

/// Normalizes a failure in one of the gateway's own collaborators (store,
/// ledger, prompt source). These are never the caller's fault and always
/// collapse to the universal fallback.
pub fn normalize_internal(source: &str, detail: &str) -> NormalizedError {
    tracing::error!(source, detail, "internal collaborator failure");

    NormalizedError {
        record: ErrorRecord::new(ErrorCode::CommonResponse, "gateway", FALLBACK_MESSAGE),
        key_flag: None,
        discovered: false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use gcommon::{ThreadId, TurnId};

    use super::*;
    use crate::NoopGatewayHooks;

    #[derive(Default)]
    struct RecordingHooks {
        unknown: Mutex<Vec<(String, String)>>,
    }

    impl GatewayHooks for RecordingHooks {
        fn on_unknown_provider_error(&self, platform: &str, message: &str) {
            self.unknown
                .lock()
                .expect("unknown lock")
                .push((platform.to_string(), message.to_string()));
        }
    }

    fn classify(error: ProviderError) -> NormalizedError {
        normalize_provider_error(&error, &NoopGatewayHooks)
    }

    #[test]
    fn every_openai_failure_shape_maps_to_exactly_one_code() {
        let cases = [
            (
                ProviderError::http(ProviderKind::OpenAi, 429, "Rate limit reached"),
                ErrorCode::RateLimitExceeded,
                429,
            ),
            (
                ProviderError::http(
                    ProviderKind::OpenAi,
                    429,
                    "You exceeded your current quota, please check billing",
                ),
                ErrorCode::QuotaExceeded,
                402,
            ),
            (
                ProviderError::http(ProviderKind::OpenAi, 401, "Incorrect API key provided"),
                ErrorCode::AuthenticationError,
                401,
            ),
            (
                ProviderError::http(ProviderKind::OpenAi, 403, "Country not supported"),
                ErrorCode::PermissionDenied,
                403,
            ),
            (
                ProviderError::http(ProviderKind::OpenAi, 404, "The model does not exist"),
                ErrorCode::ModelNotFound,
                404,
            ),
            (
                ProviderError::http(
                    ProviderKind::OpenAi,
                    400,
                    "Your request was rejected by our content_policy",
                ),
                ErrorCode::ContentPolicyViolation,
                400,
            ),
            (
                ProviderError::timeout(ProviderKind::OpenAi, "request timed out"),
                ErrorCode::Timeout,
                504,
            ),
            (
                ProviderError::connect(ProviderKind::OpenAi, "connection refused"),
                ErrorCode::ConnectionError,
                502,
            ),
            (
                ProviderError::http(ProviderKind::OpenAi, 500, "internal server error"),
                ErrorCode::StatusError,
                500,
            ),
            (
                ProviderError::decode(ProviderKind::OpenAi, "response was not JSON"),
                ErrorCode::CommonResponse,
                500,
            ),
        ];

        for (error, expected_code, expected_status) in cases {
            let normalized = classify(error);
            assert_eq!(normalized.record.code, expected_code);
            assert_eq!(normalized.record.status, expected_status);
            assert_eq!(normalized.record.platform, "openai");
            assert!(!normalized.discovered);
        }
    }

    #[test]
    fn anthropic_in_stream_errors_classify_by_vendor_type_string() {
        let rate_limited = classify(ProviderError::new(
            Some(ProviderKind::Anthropic),
            ProviderFault::Http,
            None,
            "rate_limit_error: too many requests",
        ));
        assert_eq!(rate_limited.record.code, ErrorCode::RateLimitExceeded);
        assert_eq!(rate_limited.record.platform, "anthropic");

        let overloaded = classify(ProviderError::new(
            Some(ProviderKind::Anthropic),
            ProviderFault::Http,
            None,
            "overloaded_error: servers are busy",
        ));
        assert_eq!(overloaded.record.code, ErrorCode::StatusError);

        let missing_model = classify(ProviderError::new(
            Some(ProviderKind::Anthropic),
            ProviderFault::Http,
            None,
            "not_found_error: model does not exist",
        ));
        assert_eq!(missing_model.record.code, ErrorCode::ModelNotFound);
    }

    #[test]
    fn content_policy_hides_the_vendor_message() {
        let normalized = classify(ProviderError::http(
            ProviderKind::OpenAi,
            400,
            "graphic details rejected by content_policy filter xyz",
        ));
        assert_eq!(normalized.record.code, ErrorCode::ContentPolicyViolation);
        assert_eq!(normalized.record.message, CONTENT_POLICY_MESSAGE);
    }

    #[test]
    fn key_flags_follow_the_error_policy_table() {
        assert_eq!(
            key_flag_for(ErrorCode::RateLimitExceeded),
            Some(KeyFlag::Avoid)
        );
        assert_eq!(
            key_flag_for(ErrorCode::AuthenticationError),
            Some(KeyFlag::Invalid)
        );
        assert_eq!(
            key_flag_for(ErrorCode::PermissionDenied),
            Some(KeyFlag::Invalid)
        );
        assert_eq!(
            key_flag_for(ErrorCode::ModelNotFound),
            Some(KeyFlag::Deprecated)
        );
        assert_eq!(key_flag_for(ErrorCode::Timeout), None);
        assert_eq!(key_flag_for(ErrorCode::QuotaExceeded), None);
        assert_eq!(key_flag_for(ErrorCode::ContentPolicyViolation), None);
    }

    #[test]
    fn unmatched_conditions_fall_back_and_fire_the_discovery_hook() {
        let hooks = RecordingHooks::default();
        // An HTTP fault with no status matches no OpenAI rule.
        let weird = ProviderError::new(
            Some(ProviderKind::OpenAi),
            ProviderFault::Http,
            None,
            "the server said something entirely novel",
        );

        let normalized = normalize_provider_error(&weird, &hooks);
        assert_eq!(normalized.record.code, ErrorCode::CommonResponse);
        assert_eq!(normalized.record.message, FALLBACK_MESSAGE);
        assert!(normalized.discovered);
        assert_eq!(normalized.key_flag, None);

        let unknown = hooks.unknown.lock().expect("unknown lock");
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].0, "openai");
    }

    #[test]
    fn internal_failures_collapse_to_the_fallback() {
        let normalized = normalize_internal("store", "sqlite is on fire");
        assert_eq!(normalized.record.code, ErrorCode::CommonResponse);
        assert_eq!(normalized.record.platform, "gateway");
        assert_eq!(normalized.record.message, FALLBACK_MESSAGE);
        assert!(!normalized.discovered);
    }

    #[test]
    fn hooks_default_impls_are_callable() {
        let hooks = NoopGatewayHooks;
        hooks.on_turn_start(&ThreadId::from("t"), &TurnId::from("turn"));
        hooks.on_unknown_provider_error("openai", "whatever");
    }
}
