//! 错误分类
//!
//! 纯函数：把错误消息映射为 可重试 / 永久 + 原因。先匹配永久错误（鉴权、不存在、校验、
//! 成本超限、派发配置），再匹配可重试错误（网络、超时、限流、5xx、上游不可用、过载）；
//! 都不匹配时按可重试处理，原因记为 `unknown`。
//! 429 / 限流总是可重试，先于成本超限判断。状态码只从明确的上下文中提取
//! （消息开头、`status`、`HTTP`、`error:` 之后、括号内），正文中偶然出现的三位数不算。

use std::sync::OnceLock;

use regex::Regex;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

/// 分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: ErrorClass,
    pub reason: String,
}

impl Classification {
    fn retryable(reason: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            reason: reason.into(),
        }
    }

    fn permanent(reason: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }
}

const NETWORK_CODES: &[&str] = &[
    "econnreset",
    "econnrefused",
    "econnaborted",
    "etimedout",
    "enotfound",
    "eai_again",
    "epipe",
    "ehostunreach",
    "enetunreach",
];

const AUTH_MARKERS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid api key",
    "invalid_api_key",
    "invalid x-api-key",
    "authentication failed",
    "authentication_error",
    "permission denied",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "agent not found",
    "ticket not found",
    "not found",
    "no such agent",
];

const VALIDATION_MARKERS: &[&str] = &[
    "validation",
    "invalid request",
    "invalid_request",
    "bad request",
    "unprocessable",
];

const DISPATCH_CONFIG_MARKERS: &[&str] = &[
    "dispatch config",
    "dispatch_config",
    "no agent configured",
    "agent is not configured",
    "unknown agent type",
];

const UPSTREAM_MARKERS: &[&str] = &[
    "function unavailable",
    "function_unavailable",
    "upstream unavailable",
    "bad gateway",
    "service unavailable",
];

fn status_code_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*([45]\d\d)\b|\bstatus(?:[ _]?code)?\s*[:=]?\s*([45]\d\d)\b|\bhttp(?:/[\d.]+)?\s+([45]\d\d)\b|\b(?:returned|responded with|error|failed)\s*:?\s*([45]\d\d)\b|\(([45]\d\d)\)",
        )
        .ok()
    })
    .as_ref()
}

fn extract_status(lower: &str) -> Option<u16> {
    let captures = status_code_re()?.captures(lower)?;
    captures
        .iter()
        .skip(1)
        .flatten()
        .next()
        .and_then(|m| m.as_str().parse::<u16>().ok())
}

fn is_rate_limited(status: Option<u16>, lower: &str) -> bool {
    status == Some(429)
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// 对错误消息分类；相同输入总是得到相同结果
pub fn classify(message: &str) -> Classification {
    let lower = message.to_lowercase();
    let status = extract_status(&lower);

    if is_rate_limited(status, &lower) {
        return Classification::retryable("rate_limit");
    }

    // 永久错误
    if matches!(status, Some(401) | Some(403)) || contains_any(&lower, AUTH_MARKERS) {
        return Classification::permanent("auth_failure");
    }
    if lower.contains("cost exceeded") || lower.contains("cost_exceeded") || lower.contains("exceeds limit") {
        return Classification::permanent("cost_exceeded");
    }
    if contains_any(&lower, DISPATCH_CONFIG_MARKERS) {
        return Classification::permanent("dispatch_config");
    }
    if status == Some(404) || contains_any(&lower, NOT_FOUND_MARKERS) {
        return Classification::permanent("not_found");
    }
    if matches!(status, Some(400) | Some(422)) || contains_any(&lower, VALIDATION_MARKERS) {
        return Classification::permanent("validation");
    }

    // 可重试错误
    if let Some(code) = NETWORK_CODES.iter().find(|c| lower.contains(*c)) {
        return Classification::retryable(format!("network: {code}"));
    }
    if lower.contains("socket hang up") || lower.contains("connection reset") || lower.contains("connection refused") {
        return Classification::retryable("network: connection");
    }
    if lower.contains("overloaded") || lower.contains("overload") {
        return Classification::retryable("overloaded");
    }
    if contains_any(&lower, UPSTREAM_MARKERS) {
        return Classification::retryable("upstream_unavailable");
    }
    if let Some(code) = status.filter(|s| (500..600).contains(s)) {
        return Classification::retryable(format!("server_error: {code}"));
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return Classification::retryable("timeout");
    }

    // 未识别：宁可重试也不静默失败
    Classification::retryable("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_code() {
        let c = classify("ECONNRESET");
        assert_eq!(c.class, ErrorClass::Retryable);
        assert_eq!(c.reason, "network: econnreset");
    }

    #[test]
    fn test_auth_failure() {
        let c = classify("401 unauthorized");
        assert_eq!(c.class, ErrorClass::Permanent);
        assert_eq!(c.reason, "auth_failure");
        assert_eq!(classify("Invalid API key provided").reason, "auth_failure");
        assert_eq!(classify("HTTP 403").reason, "auth_failure");
    }

    #[test]
    fn test_retryable_family() {
        assert_eq!(classify("request timed out after 30s").reason, "timeout");
        assert_eq!(classify("429 Too Many Requests").reason, "rate_limit");
        assert_eq!(classify("upstream returned 503").reason, "server_error: 503");
        assert_eq!(classify("Overloaded, try later").reason, "overloaded");
        assert_eq!(classify("FUNCTION_UNAVAILABLE: worker cold").reason, "upstream_unavailable");
        assert!(classify("502 bad gateway").is_retryable());
    }

    #[test]
    fn test_permanent_family() {
        assert_eq!(classify("Agent not found: writer").reason, "not_found");
        assert_eq!(classify("ticket not found").reason, "not_found");
        assert_eq!(classify("validation failed: instruction empty").reason, "validation");
        assert_eq!(classify("cost exceeded for execution").reason, "cost_exceeded");
        assert_eq!(classify("dispatch config missing for agent").reason, "dispatch_config");
        assert!(!classify("404").is_retryable());
    }

    #[test]
    fn test_unknown_defaults_to_retryable() {
        let c = classify("something odd happened");
        assert_eq!(c.class, ErrorClass::Retryable);
        assert_eq!(c.reason, "unknown");
    }

    #[test]
    fn test_rate_limit_wins_over_limit_wording() {
        let c = classify("429: request rate exceeds limit");
        assert_eq!(c.class, ErrorClass::Retryable);
        assert_eq!(c.reason, "rate_limit");
        assert_eq!(classify("budget exceeds limit").reason, "cost_exceeded");
    }

    #[test]
    fn test_incidental_numbers_are_not_status_codes() {
        let c = classify("Unexpected token in JSON at position 400");
        assert_eq!(c.class, ErrorClass::Retryable);
        assert_eq!(c.reason, "unknown");
        assert_eq!(classify("status: 400 malformed body").reason, "validation");
        assert_eq!(classify("HTTP/1.1 404").reason, "not_found");
        assert_eq!(classify("server responded with 422").reason, "validation");
    }

    #[test]
    fn test_auth_markers_need_a_failure() {
        let c = classify("authentication service timed out (503)");
        assert_eq!(c.class, ErrorClass::Retryable);
        assert_eq!(c.reason, "server_error: 503");
        assert_eq!(classify("authentication failed for key").reason, "auth_failure");
    }

    #[test]
    fn test_classify_is_pure() {
        for msg in ["ECONNRESET", "401 unauthorized", "weird", "500 internal"] {
            assert_eq!(classify(msg), classify(msg));
        }
    }
}
