//! Payload sanitization and threat classification.
//!
//! Strings are cleaned according to a per-field rule table keyed by the
//! field's own name (`email`, `username`, ...). Anything without a dedicated
//! rule uses `default`, whose strength depends on the validation level.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::LazyLock;
use url::{Host, Url};

use crate::audit::Severity;
use crate::config::ValidationLevel;
use crate::error::{SecurityError, SecurityResult};

/// Nesting beyond this depth is rejected outright.
pub const MAX_DEPTH: usize = 64;

const DANGEROUS_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern compiles")
}

const SCRIPT_TAG: &str = r"(?is)<script[^>]*>.*?</script>";
const JS_SCHEME: &str = r"(?i)javascript:";
const EVENT_HANDLER: &str = r"(?i)on\w+\s*=";
const SQL_KEYWORD: &str = r"(?i)(union|select|insert|delete|update|drop|create|alter|exec|execute)\s";
const SQL_META: &str = r"('|(--)|(;)|(\|)|(\*)|(%))";

static SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| re(SCRIPT_TAG));
static JS_SCHEME_RE: LazyLock<Regex> = LazyLock::new(|| re(JS_SCHEME));
static EVENT_HANDLER_RE: LazyLock<Regex> = LazyLock::new(|| re(EVENT_HANDLER));
static SQL_KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| re(SQL_KEYWORD));
static SQL_META_RE: LazyLock<Regex> = LazyLock::new(|| re(SQL_META));
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ThreatKind {
    SqlInjection,
    Xss,
    CommandInjection,
    PathTraversal,
}

struct ThreatClass {
    kind: ThreatKind,
    severity: Severity,
    patterns: Vec<(&'static str, Regex)>,
}

static THREAT_CLASSES: LazyLock<Vec<ThreatClass>> = LazyLock::new(|| {
    let class = |kind, severity, patterns: &[&'static str]| ThreatClass {
        kind,
        severity,
        patterns: patterns.iter().map(|p| (*p, re(&format!("(?i){}", p)))).collect(),
    };
    vec![
        class(
            ThreatKind::SqlInjection,
            Severity::Critical,
            &[
                SQL_META,
                r"(union|select|insert|delete|update|drop|create|alter|exec|execute)\s",
                r"(or|and)\s+\d+\s*=\s*\d+",
            ],
        ),
        class(
            ThreatKind::Xss,
            Severity::High,
            &[
                r"(?s)<script[^>]*>.*?</script>",
                r"javascript:",
                r"on\w+\s*=",
                r"(?s)<iframe[^>]*>.*?</iframe>",
                r"eval\s*\(",
            ],
        ),
        class(
            ThreatKind::CommandInjection,
            Severity::Critical,
            &[r"[;&|`$()]", r"(bash|sh|cmd|powershell)\s", r"\.\.[/\\]"],
        ),
        class(
            ThreatKind::PathTraversal,
            Severity::High,
            &[r"\.\.[/\\]", r"/(etc|proc|sys|dev)/", r"\\(windows|system32)\\"],
        ),
    ]
});

/// A pattern match reported by [`InputSanitizer::detect_threats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Threat {
    #[serde(rename = "type")]
    pub kind: ThreatKind,
    pub pattern: &'static str,
    pub severity: Severity,
}

/// Cleaning steps applied to one string, in field order.
#[derive(Debug, Clone)]
pub struct SanitizationRules {
    /// Truncate to this many characters.
    pub max_length: Option<usize>,
    /// Single-character class; characters outside it are removed.
    pub allowed_characters: Option<Regex>,
    pub blocked_patterns: Vec<Regex>,
    pub html_encode: bool,
    pub sql_escape: bool,
    pub remove_null_bytes: bool,
    pub trim_whitespace: bool,
}

impl Default for SanitizationRules {
    fn default() -> Self {
        Self {
            max_length: None,
            allowed_characters: None,
            blocked_patterns: Vec::new(),
            html_encode: false,
            sql_escape: false,
            remove_null_bytes: true,
            trim_whitespace: true,
        }
    }
}

impl SanitizationRules {
    pub fn apply(&self, value: &str) -> String {
        let mut out = if self.trim_whitespace {
            value.trim().to_string()
        } else {
            value.to_string()
        };
        if self.remove_null_bytes {
            out.retain(|c| c != '\0');
        }
        if let Some(max) = self.max_length {
            if out.chars().count() > max {
                out = out.chars().take(max).collect();
            }
        }
        if let Some(allowed) = &self.allowed_characters {
            out = allowed.find_iter(&out).map(|m| m.as_str()).collect();
        }
        for pattern in &self.blocked_patterns {
            out = pattern.replace_all(&out, "").into_owned();
        }
        if self.html_encode {
            out = html_encode(&out);
        }
        if self.sql_escape {
            out = sql_escape(&out);
        }
        out
    }
}

/// Result of [`InputSanitizer::validate_url`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlCheck {
    pub is_valid: bool,
    pub is_safe: bool,
    pub issues: Vec<String>,
}

pub struct InputSanitizer {
    level: ValidationLevel,
    default_rules: HashMap<String, SanitizationRules>,
}

impl InputSanitizer {
    pub fn new(level: ValidationLevel) -> Self {
        Self {
            level,
            default_rules: default_rules(level),
        }
    }

    pub fn level(&self) -> ValidationLevel {
        self.level
    }

    /// Sanitize every string in `data` using the default rule table.
    pub fn sanitize(&self, data: &Value) -> SecurityResult<Value> {
        self.sanitize_with(data, &HashMap::new())
    }

    /// Like [`sanitize`](Self::sanitize) with `custom` rules taking precedence per field.
    pub fn sanitize_with(
        &self,
        data: &Value,
        custom: &HashMap<String, SanitizationRules>,
    ) -> SecurityResult<Value> {
        self.sanitize_value(data, custom, "default", 0)
    }

    pub fn sanitize_field(&self, value: &str, field: &str) -> String {
        self.rules_for(field, &HashMap::new()).apply(value)
    }

    pub fn detect_threats(&self, input: &str) -> Vec<Threat> {
        let mut threats = Vec::new();
        for class in THREAT_CLASSES.iter() {
            for (pattern, regex) in &class.patterns {
                if regex.is_match(input) {
                    threats.push(Threat {
                        kind: class.kind,
                        pattern: *pattern,
                        severity: class.severity,
                    });
                }
            }
        }
        threats
    }

    /// Strip null bytes and script injection; strict mode also strips SQL syntax.
    pub fn remove_dangerous_patterns(&self, input: &str) -> String {
        let mut out = input.replace('\0', "");
        for pattern in [&*SCRIPT_RE, &*JS_SCHEME_RE, &*EVENT_HANDLER_RE] {
            out = pattern.replace_all(&out, "").into_owned();
        }
        if self.level == ValidationLevel::Strict {
            out = SQL_KEYWORD_RE.replace_all(&out, "").into_owned();
            out = SQL_META_RE.replace_all(&out, "").into_owned();
        }
        out
    }

    pub fn validate_email(&self, email: &str) -> bool {
        email.len() <= 254 && EMAIL_RE.is_match(email)
    }

    pub fn validate_url(&self, raw: &str) -> UrlCheck {
        let mut issues = Vec::new();
        let mut is_safe = true;

        let parsed = match Url::parse(raw) {
            Ok(url) => url,
            Err(_) => {
                return UrlCheck {
                    is_valid: false,
                    is_safe: false,
                    issues: vec!["Invalid URL format".to_string()],
                }
            }
        };
        let is_valid = parsed.host().is_some();

        if !matches!(parsed.scheme(), "http" | "https") {
            issues.push("Unsafe protocol".to_string());
            is_safe = false;
        }
        if is_private_host(&parsed) {
            issues.push("Private/internal network address".to_string());
            is_safe = false;
        }
        let lowered = raw.to_ascii_lowercase();
        if lowered.contains("javascript:") || lowered.contains("data:") {
            issues.push("Potentially dangerous URL scheme".to_string());
            is_safe = false;
        }

        UrlCheck {
            is_valid,
            is_safe,
            issues,
        }
    }

    fn rules_for<'a>(
        &'a self,
        field: &str,
        custom: &'a HashMap<String, SanitizationRules>,
    ) -> &'a SanitizationRules {
        custom
            .get(field)
            .or_else(|| self.default_rules.get(field))
            .unwrap_or(&self.default_rules["default"])
    }

    fn sanitize_value(
        &self,
        value: &Value,
        custom: &HashMap<String, SanitizationRules>,
        field: &str,
        depth: usize,
    ) -> SecurityResult<Value> {
        if depth > MAX_DEPTH {
            return Err(SecurityError::InvalidInput(format!(
                "payload nested deeper than {} levels",
                MAX_DEPTH
            )));
        }
        Ok(match value {
            Value::String(s) => Value::String(self.rules_for(field, custom).apply(s)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.sanitize_value(item, custom, field, depth + 1))
                    .collect::<SecurityResult<_>>()?,
            ),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, val) in map {
                    if DANGEROUS_KEYS.contains(&key.as_str()) {
                        tracing::debug!(key = %key, "Dropping prototype key");
                        continue;
                    }
                    let clean_key = self.sanitize_field(key, "objectKey");
                    if clean_key.is_empty() {
                        continue;
                    }
                    out.insert(clean_key, self.sanitize_value(val, custom, key, depth + 1)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }
}

fn default_rules(level: ValidationLevel) -> HashMap<String, SanitizationRules> {
    let default = match level {
        ValidationLevel::Strict => SanitizationRules {
            blocked_patterns: vec![
                SCRIPT_RE.clone(),
                JS_SCHEME_RE.clone(),
                EVENT_HANDLER_RE.clone(),
                SQL_KEYWORD_RE.clone(),
            ],
            ..SanitizationRules::default()
        },
        ValidationLevel::Moderate => SanitizationRules {
            blocked_patterns: vec![SCRIPT_RE.clone(), JS_SCHEME_RE.clone(), EVENT_HANDLER_RE.clone()],
            ..SanitizationRules::default()
        },
        ValidationLevel::Basic => SanitizationRules::default(),
    };

    let mut rules = HashMap::new();
    rules.insert("default".to_string(), default);
    rules.insert(
        "email".to_string(),
        SanitizationRules {
            max_length: Some(254),
            allowed_characters: Some(re(r"[a-zA-Z0-9._%+@-]")),
            ..SanitizationRules::default()
        },
    );
    rules.insert(
        "username".to_string(),
        SanitizationRules {
            max_length: Some(50),
            allowed_characters: Some(re(r"[a-zA-Z0-9_-]")),
            ..SanitizationRules::default()
        },
    );
    rules.insert(
        "password".to_string(),
        SanitizationRules {
            max_length: Some(128),
            trim_whitespace: false,
            ..SanitizationRules::default()
        },
    );
    rules.insert(
        "url".to_string(),
        SanitizationRules {
            max_length: Some(2048),
            blocked_patterns: vec![JS_SCHEME_RE.clone(), re(r"(?i)data:"), re(r"(?i)vbscript:")],
            ..SanitizationRules::default()
        },
    );
    rules.insert(
        "objectKey".to_string(),
        SanitizationRules {
            max_length: Some(100),
            allowed_characters: Some(re(r"[a-zA-Z0-9_]")),
            ..SanitizationRules::default()
        },
    );
    rules
}

pub fn html_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

pub fn sql_escape(input: &str) -> String {
    input.replace('\'', "''")
}

/// True when the URL points at loopback, private, link-local or unspecified space.
pub fn is_private_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => is_private_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_private_ip(IpAddr::V6(ip)),
        None => false,
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(v4));
            }
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}
