//! Cheap model identification for inbound requests.
//!
//! Resolution order: override header, model segment in the URL path, a
//! bounded substring scan of the body for a `"model"` field, the configured
//! default model, and finally the reserved unknown key. The body is never
//! parsed structurally.

use crate::config::{ExtractorConfig, UNKNOWN_MODEL};
use crate::errors::GatewayError;
use axum::http::{HeaderMap, Method};
use tracing::{debug, warn};

/// Longest model name accepted from a header, path or body.
const MAX_MODEL_LEN: usize = 256;

/// Where a model identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Header,
    Path,
    Body,
    Default,
    Unknown,
}

impl ModelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSource::Header => "header",
            ModelSource::Path => "path",
            ModelSource::Body => "body",
            ModelSource::Default => "default",
            ModelSource::Unknown => "unknown",
        }
    }
}

/// Model identity attached to request extensions so later stages never
/// reparse the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub model: String,
    pub source: ModelSource,
}

pub struct ModelExtractor<'a> {
    config: &'a ExtractorConfig,
}

impl<'a> ModelExtractor<'a> {
    pub fn new(config: &'a ExtractorConfig) -> Self {
        Self { config }
    }

    /// Resolve the model for a request. `body` is the peeked prefix, if any.
    pub fn extract(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> ResolvedModel {
        if let Some(model) = self.from_header(headers) {
            return resolved(model, ModelSource::Header);
        }

        if let Some(model) = self.from_path(path) {
            return resolved(model, ModelSource::Path);
        }

        let has_body = !matches!(*method, Method::GET | Method::HEAD | Method::DELETE);
        if let (true, Some(body)) = (has_body, body) {
            match scan_string_field(body, "model") {
                Ok(Some(model)) => return resolved(model, ModelSource::Body),
                Ok(None) => {}
                Err(e) => warn!("{}; falling back to default model", e),
            }
        }

        match &self.config.default_model {
            Some(model) => resolved(model, ModelSource::Default),
            None => {
                debug!("No model resolvable for {} {}", method, path);
                resolved(UNKNOWN_MODEL, ModelSource::Unknown)
            }
        }
    }

    fn from_header<'h>(&self, headers: &'h HeaderMap) -> Option<&'h str> {
        headers
            .get(self.config.override_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| is_valid_model(value))
    }

    fn from_path<'p>(&self, path: &'p str) -> Option<&'p str> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        while let Some(segment) = segments.next() {
            if self.config.path_markers.iter().any(|marker| marker == segment) {
                let candidate = segments.next()?;
                // Gemini style: /models/gemini-pro:generateContent
                let model = candidate.split(':').next().unwrap_or(candidate);
                return Some(model).filter(|m| is_valid_model(m));
            }
        }
        None
    }
}

fn resolved(model: &str, source: ModelSource) -> ResolvedModel {
    crate::metrics::record_model_resolution(source.as_str());
    ResolvedModel {
        model: model.to_string(),
        source,
    }
}

fn is_valid_model(value: &str) -> bool {
    !value.is_empty() && value.len() <= MAX_MODEL_LEN
}

/// Find `"<field>"` followed by `:` and a JSON string, without parsing the
/// document. Occurrences inside other strings (escaped quotes) or used as
/// values are skipped. Values containing escapes are reported as ambiguous.
pub fn scan_string_field<'b>(body: &'b [u8], field: &str) -> Result<Option<&'b str>, GatewayError> {
    let Some(start) = find_field_value(body, field) else {
        return Ok(None);
    };

    if body.get(start) != Some(&b'"') {
        return Err(GatewayError::ModelExtractionAmbiguous(format!(
            "\"{}\" is not a string",
            field
        )));
    }

    let value_start = start + 1;
    let rest = &body[value_start..];
    let end = rest
        .iter()
        .take(MAX_MODEL_LEN + 1)
        .position(|&b| b == b'"' || b == b'\\')
        .ok_or_else(|| {
            GatewayError::ModelExtractionAmbiguous(format!("\"{}\" value is unterminated or too long", field))
        })?;

    if rest[end] == b'\\' {
        return Err(GatewayError::ModelExtractionAmbiguous(format!(
            "\"{}\" value contains escapes",
            field
        )));
    }

    let value = std::str::from_utf8(&rest[..end])
        .map_err(|e| GatewayError::ModelExtractionAmbiguous(format!("invalid UTF-8: {}", e)))?;

    if value.is_empty() {
        return Err(GatewayError::ModelExtractionAmbiguous(format!("\"{}\" is empty", field)));
    }

    Ok(Some(value))
}

/// Same scan as [`scan_string_field`] for unsigned integer fields such as
/// `max_tokens`. Anything that is not a plain integer yields `None`.
pub fn scan_u64_field(body: &[u8], field: &str) -> Option<u64> {
    let start = find_field_value(body, field)?;
    let digits = body[start..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 || digits > 19 {
        return None;
    }
    std::str::from_utf8(&body[start..start + digits])
        .ok()?
        .parse()
        .ok()
}

/// Offset of the first byte of the value for `"<field>":`.
fn find_field_value(body: &[u8], field: &str) -> Option<usize> {
    let needle_len = field.len() + 2;
    let mut offset = 0;

    while offset + needle_len <= body.len() {
        let found = body[offset..]
            .windows(needle_len)
            .position(|w| w[0] == b'"' && w[needle_len - 1] == b'"' && &w[1..needle_len - 1] == field.as_bytes())?;
        let at = offset + found;
        offset = at + needle_len;

        if at > 0 && body[at - 1] == b'\\' {
            continue;
        }

        let after = skip_whitespace(body, offset);
        if body.get(after) != Some(&b':') {
            continue;
        }

        return Some(skip_whitespace(body, after + 1));
    }

    None
}

fn skip_whitespace(body: &[u8], mut pos: usize) -> usize {
    while pos < body.len() && body[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config(default_model: Option<&str>) -> ExtractorConfig {
        ExtractorConfig {
            default_model: default_model.map(str::to_string),
            ..ExtractorConfig::default()
        }
    }

    #[test]
    fn test_body_model_is_resolved() {
        let cfg = config(None);
        let resolved = ModelExtractor::new(&cfg).extract(
            &Method::POST,
            "/v1/chat/completions",
            &HeaderMap::new(),
            Some(br#"{"model":"gpt-4"}"#),
        );
        assert_eq!(resolved.model, "gpt-4");
        assert_eq!(resolved.source, ModelSource::Body);
    }

    #[test]
    fn test_header_wins_over_body() {
        let cfg = config(None);
        let mut headers = HeaderMap::new();
        headers.insert("x-model-override", HeaderValue::from_static("claude-3"));

        let resolved = ModelExtractor::new(&cfg).extract(
            &Method::POST,
            "/v1/chat/completions",
            &headers,
            Some(br#"{"model":"gpt-4"}"#),
        );
        assert_eq!(resolved.model, "claude-3");
        assert_eq!(resolved.source, ModelSource::Header);
    }

    #[test]
    fn test_default_when_nothing_present() {
        let cfg = config(Some("gpt-3.5-turbo"));
        let resolved = ModelExtractor::new(&cfg).extract(
            &Method::POST,
            "/v1/chat/completions",
            &HeaderMap::new(),
            Some(br#"{"messages":[]}"#),
        );
        assert_eq!(resolved.model, "gpt-3.5-turbo");
        assert_eq!(resolved.source, ModelSource::Default);
    }

    #[test]
    fn test_unknown_without_default() {
        let cfg = config(None);
        let resolved =
            ModelExtractor::new(&cfg).extract(&Method::POST, "/v1/embeddings", &HeaderMap::new(), None);
        assert_eq!(resolved.model, UNKNOWN_MODEL);
        assert_eq!(resolved.source, ModelSource::Unknown);
    }

    #[test]
    fn test_path_model() {
        let cfg = config(None);
        let extractor = ModelExtractor::new(&cfg);

        let gemini = extractor.extract(
            &Method::POST,
            "/v1beta/models/gemini-pro:generateContent",
            &HeaderMap::new(),
            Some(br#"{"model":"ignored"}"#),
        );
        assert_eq!(gemini.model, "gemini-pro");
        assert_eq!(gemini.source, ModelSource::Path);

        let azure = extractor.extract(
            &Method::POST,
            "/openai/deployments/gpt-4o/chat/completions",
            &HeaderMap::new(),
            None,
        );
        assert_eq!(azure.model, "gpt-4o");
    }

    #[test]
    fn test_scan_skips_nested_and_value_occurrences() {
        let body = br#"{"messages":[{"content":"say \"model\": x"}],"note":"model", "model" : "llama-3"}"#;
        assert_eq!(scan_string_field(body, "model").unwrap(), Some("llama-3"));
    }

    #[test]
    fn test_escaped_value_is_ambiguous() {
        let cfg = config(Some("fallback"));
        let body = br#"{"model":"gpt\"4"}"#;
        assert!(matches!(
            scan_string_field(body, "model"),
            Err(GatewayError::ModelExtractionAmbiguous(_))
        ));

        let resolved = ModelExtractor::new(&cfg).extract(&Method::POST, "/v1/x", &HeaderMap::new(), Some(body));
        assert_eq!(resolved.model, "fallback");
    }

    #[test]
    fn test_scan_max_tokens() {
        let body = br#"{"model":"gpt-4","max_tokens": 512,"temperature":0.2}"#;
        assert_eq!(scan_u64_field(body, "max_tokens"), Some(512));
        assert_eq!(scan_u64_field(body, "temperature"), None);
        assert_eq!(scan_u64_field(body, "missing"), None);
    }
}
