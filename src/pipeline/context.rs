//! Request context carried through the pipeline.
//!
//! The stage is part of the type: `RequestContext<Raw>` can only become
//! `Sanitized`, then `Scanned`, then a [`SignedRequest`]. Stage transitions
//! are crate-private, so a transport can only ever be handed a request that
//! went through every stage.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use crate::credentials::Credential;
use crate::error::SecurityResult;
use crate::security::{InputSanitizer, PolicyFinding, PolicyScanner, RequestMeta};
use crate::signing::{RequestSigner, SignedEnvelope};

pub const AUTHORIZATION: &str = "Authorization";
pub const KEY_ROTATION: &str = "X-Key-Rotation";

#[derive(Debug)]
pub struct Raw;
#[derive(Debug)]
pub struct Sanitized;
#[derive(Debug)]
pub struct Scanned;

#[derive(Debug)]
pub struct RequestContext<S> {
    payload: Value,
    meta: RequestMeta,
    findings: Vec<PolicyFinding>,
    _stage: PhantomData<S>,
}

impl<S> RequestContext<S> {
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    fn advance<T>(self, payload: Value) -> RequestContext<T> {
        RequestContext {
            payload,
            meta: self.meta,
            findings: self.findings,
            _stage: PhantomData,
        }
    }
}

impl RequestContext<Raw> {
    pub fn new(payload: Value, meta: RequestMeta) -> Self {
        Self {
            payload,
            meta,
            findings: Vec::new(),
            _stage: PhantomData,
        }
    }

    pub(crate) fn sanitize(self, sanitizer: &InputSanitizer) -> SecurityResult<RequestContext<Sanitized>> {
        let clean = sanitizer.sanitize(&self.payload)?;
        Ok(self.advance(clean))
    }
}

impl RequestContext<Sanitized> {
    pub(crate) fn scan(self, scanner: &PolicyScanner) -> RequestContext<Scanned> {
        let findings = scanner.scan(&self.payload);
        RequestContext {
            payload: self.payload,
            meta: self.meta,
            findings,
            _stage: PhantomData,
        }
    }
}

impl RequestContext<Scanned> {
    pub fn findings(&self) -> &[PolicyFinding] {
        &self.findings
    }

    /// Sign (when a signer is given) and attach the credential headers.
    pub(crate) async fn sign(
        self,
        signer: Option<&RequestSigner>,
        credential: &Credential,
    ) -> SecurityResult<SignedRequest> {
        let envelope = match signer {
            Some(signer) => Some(signer.sign_request(self.payload.clone()).await?),
            None => None,
        };
        let mut headers = BTreeMap::new();
        headers.insert(AUTHORIZATION.to_string(), format!("Bearer {}", credential.primary));
        headers.insert(KEY_ROTATION.to_string(), credential.rotation_count.to_string());
        Ok(SignedRequest {
            payload: self.payload,
            envelope,
            headers,
            meta: self.meta,
            findings: self.findings,
        })
    }
}

/// A request that passed admission, sanitization, scanning and signing.
#[derive(Clone)]
pub struct SignedRequest {
    payload: Value,
    envelope: Option<SignedEnvelope>,
    headers: BTreeMap<String, String>,
    meta: RequestMeta,
    findings: Vec<PolicyFinding>,
}

impl SignedRequest {
    /// The sanitized payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// `None` only when request signing is disabled.
    pub fn envelope(&self) -> Option<&SignedEnvelope> {
        self.envelope.as_ref()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    pub fn findings(&self) -> &[PolicyFinding] {
        &self.findings
    }

    /// JSON body for the wire: the envelope when signed, else the payload.
    pub fn body(&self) -> SecurityResult<Value> {
        match &self.envelope {
            Some(envelope) => Ok(serde_json::to_value(envelope)?),
            None => Ok(self.payload.clone()),
        }
    }
}

impl fmt::Debug for SignedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<&str> = self.headers.keys().map(String::as_str).collect();
        f.debug_struct("SignedRequest")
            .field("payload", &self.payload)
            .field("nonce", &self.envelope.as_ref().map(|e| e.nonce.as_str()))
            .field("headers", &headers)
            .field("findings", &self.findings.len())
            .finish()
    }
}
