//! Caller metadata used for admission decisions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Who is calling: network address, client id and request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub ip: Option<String>,
    pub client_id: Option<String>,
    /// Header names are stored lowercase.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl RequestMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Rate limit key: ip, then client id, then the first `x-forwarded-for` hop, then `default`.
    pub fn identifier(&self) -> String {
        non_empty(self.ip.as_deref())
            .or_else(|| non_empty(self.client_id.as_deref()))
            .or_else(|| self.forwarded_for())
            .unwrap_or("default")
            .to_string()
    }

    /// Best guess at the client address: ip, first forwarded hop, `x-real-ip`.
    pub fn client_ip(&self) -> Option<&str> {
        non_empty(self.ip.as_deref())
            .or_else(|| self.forwarded_for())
            .or_else(|| non_empty(self.header("x-real-ip")))
    }

    fn forwarded_for(&self) -> Option<&str> {
        self.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
