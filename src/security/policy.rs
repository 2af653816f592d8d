//! Advisory OWASP Top 10 (2021) payload scanner.
//!
//! Each check looks at the top-level shape of a request payload and reports
//! at most one finding. Findings never change control flow here; the
//! pipeline decides whether to block on them.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;
use url::Url;

use crate::audit::Severity;
use crate::security::sanitizer::is_private_host;

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").expect("static pattern compiles"));
static URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").expect("static pattern compiles"));
static SQL_RES: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"('|(--)|(;)|(\|)|(\*)|(%))").expect("static pattern compiles"),
        Regex::new(r"(?i)(union|select|insert|delete|update|drop|create|alter|exec|execute)\s")
            .expect("static pattern compiles"),
    ]
});
static XSS_RES: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("static pattern compiles"),
        Regex::new(r"(?i)javascript:").expect("static pattern compiles"),
        Regex::new(r"(?i)on\w+\s*=").expect("static pattern compiles"),
    ]
});

const WEAK_ALGORITHMS: [&str; 4] = ["md5", "sha1", "des", "rc4"];
const SENSITIVE_KEYS: [&str; 4] = ["password", "secret", "token", "key"];
const AUDITED_ACTIONS: [&str; 3] = ["login", "delete", "admin"];
const MIN_SESSION_TOKEN_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyFinding {
    pub category: &'static str,
    pub name: &'static str,
    pub severity: Severity,
    pub description: &'static str,
    pub mitigation: Vec<&'static str>,
}

type CheckFn = fn(&Value) -> Option<(Severity, &'static str, &'static [&'static str])>;

struct PolicyCheck {
    category: &'static str,
    name: &'static str,
    run: CheckFn,
}

const CHECKS: [PolicyCheck; 10] = [
    PolicyCheck { category: "A01:2021", name: "Broken Access Control", run: broken_access_control },
    PolicyCheck { category: "A02:2021", name: "Cryptographic Failures", run: cryptographic_failures },
    PolicyCheck { category: "A03:2021", name: "Injection Attacks", run: injection },
    PolicyCheck { category: "A04:2021", name: "Insecure Design", run: insecure_design },
    PolicyCheck { category: "A05:2021", name: "Security Misconfiguration", run: misconfiguration },
    PolicyCheck { category: "A06:2021", name: "Vulnerable Components", run: vulnerable_components },
    PolicyCheck { category: "A07:2021", name: "Authentication Failures", run: authentication_failures },
    PolicyCheck { category: "A08:2021", name: "Integrity Failures", run: integrity_failures },
    PolicyCheck { category: "A09:2021", name: "Logging Failures", run: logging_failures },
    PolicyCheck { category: "A10:2021", name: "SSRF", run: ssrf },
];

/// Stateless scanner over request payloads.
#[derive(Debug, Clone, Copy)]
pub struct PolicyScanner {
    enabled: bool,
}

impl PolicyScanner {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scan(&self, data: &Value) -> Vec<PolicyFinding> {
        if !self.enabled {
            return Vec::new();
        }
        CHECKS
            .iter()
            .filter_map(|check| {
                (check.run)(data).map(|(severity, description, mitigation)| PolicyFinding {
                    category: check.category,
                    name: check.name,
                    severity,
                    description,
                    mitigation: mitigation.to_vec(),
                })
            })
            .collect()
    }

    /// `(category, name)` of every check this scanner runs.
    pub fn available_checks(&self) -> Vec<(&'static str, &'static str)> {
        if !self.enabled {
            return Vec::new();
        }
        CHECKS.iter().map(|c| (c.category, c.name)).collect()
    }
}

fn field_text(data: &Value, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn broken_access_control(data: &Value) -> Option<(Severity, &'static str, &'static [&'static str])> {
    let user_id = field_text(data, "user_id")?;
    DIGITS_RE.is_match(&user_id).then_some((
        Severity::Medium,
        "Sequential user ID detected - potential IDOR vulnerability",
        &["Use UUIDs instead of sequential IDs", "Implement proper authorization checks"],
    ))
}

fn cryptographic_failures(data: &Value) -> Option<(Severity, &'static str, &'static [&'static str])> {
    let encryption = field_text(data, "encryption")?.to_ascii_lowercase();
    WEAK_ALGORITHMS.iter().any(|alg| encryption.contains(alg)).then_some((
        Severity::Critical,
        "Weak cryptographic algorithm detected",
        &["Use SHA-256 or stronger", "Use AES-256 for encryption", "Avoid deprecated algorithms"],
    ))
}

fn injection(data: &Value) -> Option<(Severity, &'static str, &'static [&'static str])> {
    let text = match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if SQL_RES.iter().any(|re| re.is_match(&text)) {
        return Some((
            Severity::Critical,
            "Potential SQL injection detected",
            &["Use parameterized queries", "Sanitize all user input", "Use ORM frameworks"],
        ));
    }
    if XSS_RES.iter().any(|re| re.is_match(&text)) {
        return Some((
            Severity::High,
            "Potential XSS attack detected",
            &["HTML encode output", "Use Content Security Policy", "Validate and sanitize input"],
        ));
    }
    None
}

fn insecure_design(data: &Value) -> Option<(Severity, &'static str, &'static [&'static str])> {
    let map = data.as_object()?;
    SENSITIVE_KEYS.iter().any(|k| map.contains_key(*k)).then_some((
        Severity::High,
        "Sensitive data detected in request",
        &["Remove sensitive data from logs", "Use secure transport", "Hash sensitive values"],
    ))
}

fn misconfiguration(data: &Value) -> Option<(Severity, &'static str, &'static [&'static str])> {
    let map = data.as_object()?;
    let debug = map.get("debug").and_then(Value::as_bool).unwrap_or(false);
    (debug || map.contains_key("stack_trace")).then_some((
        Severity::Medium,
        "Debug information exposed",
        &["Disable debug mode in production", "Remove stack traces from responses"],
    ))
}

fn vulnerable_components(data: &Value) -> Option<(Severity, &'static str, &'static [&'static str])> {
    let version = field_text(data, "version")?;
    (version.starts_with("1.") || version.starts_with("0.")).then_some((
        Severity::Medium,
        "Potentially outdated component version detected",
        &["Update to latest stable version", "Regularly audit dependencies"],
    ))
}

fn authentication_failures(data: &Value) -> Option<(Severity, &'static str, &'static [&'static str])> {
    let token = field_text(data, "session_token")?;
    (token.chars().count() < MIN_SESSION_TOKEN_LEN).then_some((
        Severity::High,
        "Weak session token detected",
        &["Use cryptographically strong tokens", "Implement proper session management"],
    ))
}

fn integrity_failures(data: &Value) -> Option<(Severity, &'static str, &'static [&'static str])> {
    let map = data.as_object()?;
    (map.contains_key("file_url") && !map.contains_key("checksum") && !map.contains_key("signature"))
        .then_some((
            Severity::Medium,
            "File transfer without integrity verification",
            &["Use checksums or digital signatures", "Verify file integrity"],
        ))
}

fn logging_failures(data: &Value) -> Option<(Severity, &'static str, &'static [&'static str])> {
    let map = data.as_object()?;
    let action = map.get("action").and_then(Value::as_str)?;
    let logged = map.get("logged").map(is_truthy).unwrap_or(false);
    (AUDITED_ACTIONS.contains(&action) && !logged).then_some((
        Severity::Medium,
        "Security-relevant action without logging",
        &["Implement comprehensive audit logging", "Monitor security events"],
    ))
}

fn ssrf(data: &Value) -> Option<(Severity, &'static str, &'static [&'static str])> {
    let mut urls = Vec::new();
    collect_urls(data, &mut urls);
    urls.iter()
        .filter_map(|raw| Url::parse(raw).ok())
        .any(|url| is_private_host(&url))
        .then_some((
            Severity::High,
            "Potential SSRF - request to private network",
            &["Validate and whitelist allowed URLs", "Use URL filtering"],
        ))
}

fn collect_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(URL_RE.find_iter(s).map(|m| m.as_str().to_string())),
        Value::Array(items) => items.iter().for_each(|v| collect_urls(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_urls(v, out)),
        _ => {}
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
