//! Configuration for the gated mock server.
//!
//! Defines route matchers, reply specs, and server settings. Everything here
//! validates at registration time; a malformed stub is a test-authoring
//! mistake and fails fast instead of hanging a scenario.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Errors surfaced when a stub, route, or reply spec fails validation.
#[derive(Debug, Error)]
pub enum StubError {
    #[error("stub id cannot be empty")]
    EmptyId,

    #[error("duplicate stub id {0:?}")]
    DuplicateId(String),

    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    #[error("invalid regex {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid glob {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("invalid base64 reply body: {0}")]
    InvalidBase64(#[source] base64::DecodeError),

    #[error("pass-through stub {0:?} requires an upstream origin in settings")]
    MissingUpstream(String),
}

/// Top-level configuration for the server binary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Stub definitions, installed in order. When several stubs cover the
    /// same route, the one installed last wins.
    #[serde(default)]
    pub stubs: Vec<StubDefinition>,

    /// Global settings
    #[serde(default)]
    pub settings: Settings,

    /// Reply sent when no stub matches (instead of the built-in 404).
    #[serde(default)]
    pub default_reply: Option<ReplySpec>,
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), StubError> {
        let mut seen = HashSet::new();
        for stub in &self.stubs {
            stub.validate()?;
            if !seen.insert(stub.id.as_str()) {
                return Err(StubError::DuplicateId(stub.id.clone()));
            }
            if stub.reply.is_none() && self.settings.upstream.is_none() {
                return Err(StubError::MissingUpstream(stub.id.clone()));
            }
        }
        if let Some(reply) = &self.default_reply {
            reply.validate()?;
        }
        Ok(())
    }
}

/// A single stub definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubDefinition {
    /// Unique identifier for this stub
    pub id: String,

    /// Optional name/description
    #[serde(default)]
    pub name: Option<String>,

    /// Which requests this stub applies to
    pub route: RouteMatcher,

    /// Reply to send. Absent means pass the request through to the upstream
    /// and gate delivery of whatever it answers.
    #[serde(default)]
    pub reply: Option<ReplySpec>,

    /// Park matching requests until the stub is released.
    #[serde(default)]
    pub hold: bool,

    /// Whether this stub is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl StubDefinition {
    /// Validate the stub definition.
    pub fn validate(&self) -> Result<(), StubError> {
        if self.id.is_empty() {
            return Err(StubError::EmptyId);
        }
        self.route.validate()?;
        if let Some(reply) = &self.reply {
            reply.validate()?;
        }
        Ok(())
    }
}

/// Which outbound requests a registration applies to.
///
/// Opaque to the gating core; matching semantics live in
/// [`crate::matcher`]. Immutable once passed to registration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RouteMatcher {
    /// HTTP method(s) to match (empty = any)
    #[serde(default)]
    pub method: Vec<String>,

    /// Path matching
    #[serde(default)]
    pub path: Option<PathMatcher>,

    /// Query parameter matching
    #[serde(default)]
    pub query: HashMap<String, QueryMatcher>,

    /// Header matching
    #[serde(default)]
    pub headers: HashMap<String, HeaderMatcher>,
}

impl RouteMatcher {
    /// Matcher for a GET of exactly `path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: vec!["GET".to_string()],
            ..Self::exact(path)
        }
    }

    /// Matcher for exactly `path`, any method.
    pub fn exact(path: impl Into<String>) -> Self {
        Self {
            path: Some(PathMatcher::Exact { value: path.into() }),
            ..Self::default()
        }
    }

    /// Validate the route matcher: every pattern must compile.
    pub fn validate(&self) -> Result<(), StubError> {
        if let Some(path) = &self.path {
            path.validate()?;
        }
        for matcher in self.query.values() {
            if let QueryMatcher::Regex { pattern } = matcher {
                check_regex(pattern)?;
            }
        }
        for matcher in self.headers.values() {
            if let HeaderMatcher::Regex { pattern } = matcher {
                check_regex(pattern)?;
            }
        }
        Ok(())
    }
}

fn check_regex(pattern: &str) -> Result<(), StubError> {
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|source| StubError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })
}

/// Path matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathMatcher {
    /// Exact path match
    Exact { value: String },
    /// Path prefix match
    Prefix { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Glob pattern match
    Glob { pattern: String },
    /// Path with parameters (e.g., /comics/{num})
    Template { template: String },
}

impl PathMatcher {
    /// Validate the path matcher.
    pub fn validate(&self) -> Result<(), StubError> {
        match self {
            PathMatcher::Regex { pattern } => check_regex(pattern),
            PathMatcher::Glob { pattern } => globset::Glob::new(pattern)
                .map(|_| ())
                .map_err(|source| StubError::InvalidGlob {
                    pattern: pattern.clone(),
                    source,
                }),
            _ => Ok(()),
        }
    }
}

/// Query parameter matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Parameter must be present (any value)
    Present,
    /// Parameter must be absent
    Absent,
}

/// Header matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Header must be present (any value)
    Present,
    /// Header must be absent
    Absent,
    /// Value must contain substring
    Contains { value: String },
}

/// Reply specification for a matched request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplySpec {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Reply headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Reply body
    #[serde(default)]
    pub body: Option<ReplyBody>,

    /// Render string fields of the body against the match context.
    #[serde(default)]
    pub template: bool,
}

fn default_status() -> u16 {
    200
}

impl ReplySpec {
    /// Canned JSON reply with the given status.
    pub fn json(status: u16, content: serde_json::Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Some(ReplyBody::Json { content }),
            template: false,
        }
    }

    /// Validate the reply spec.
    pub fn validate(&self) -> Result<(), StubError> {
        if !(100..=599).contains(&self.status) {
            return Err(StubError::InvalidStatus(self.status));
        }
        if let Some(ReplyBody::Base64 { content }) = &self.body {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(content)
                .map_err(StubError::InvalidBase64)?;
        }
        Ok(())
    }
}

/// Reply body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
    /// Load from file
    File { path: String },
}

impl ReplyBody {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            ReplyBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ReplyBody::Json { content } => Ok(serde_json::to_string(content)?.into_bytes()),
            ReplyBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
            }
            ReplyBody::File { path } => std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read file {}: {}", path, e)),
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> &'static str {
        match self {
            ReplyBody::Text { .. } => "text/plain",
            ReplyBody::Json { .. } => "application/json",
            ReplyBody::Base64 { .. } => "application/octet-stream",
            ReplyBody::File { .. } => "application/octet-stream",
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Log all matched stubs
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Forward unmatched requests to the upstream instead of replying 404
    #[serde(default)]
    pub passthrough_unmatched: bool,

    /// Origin (scheme://host:port) requests are forwarded to for
    /// pass-through stubs
    #[serde(default)]
    pub upstream: Option<String>,

    /// Default content type for replies
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            passthrough_unmatched: false,
            upstream: None,
            default_content_type: default_content_type(),
        }
    }
}

fn default_content_type() -> String {
    "application/json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_stub() {
        let yaml = r#"
stubs:
  - id: comic
    route:
      method: [GET]
      path:
        type: exact
        value: /123/info.0.json
    reply:
      status: 200
      body:
        type: json
        content:
          img: "https://imgs.xkcd.com/comics/compiling.png"
          alt: "Compiling"
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.stubs.len(), 1);
        assert_eq!(config.stubs[0].id, "comic");
        assert!(!config.stubs[0].hold);
        assert!(config.stubs[0].enabled);
        config.validate().unwrap();
    }

    #[test]
    fn parse_held_passthrough_stub() {
        let yaml = r#"
stubs:
  - id: passthrough
    hold: true
    route:
      path:
        type: prefix
        value: /api
settings:
  upstream: "http://127.0.0.1:9999"
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.stubs[0].hold);
        assert!(config.stubs[0].reply.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn passthrough_stub_without_upstream_is_rejected() {
        let yaml = r#"
stubs:
  - id: passthrough
    route:
      path:
        type: exact
        value: /api
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(StubError::MissingUpstream(id)) if id == "passthrough"
        ));
    }

    #[test]
    fn duplicate_stub_ids_are_rejected() {
        let yaml = r#"
stubs:
  - id: twice
    route:
      path:
        type: exact
        value: /a
    reply:
      status: 200
  - id: twice
    route:
      path:
        type: exact
        value: /b
    reply:
      status: 200
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(StubError::DuplicateId(id)) if id == "twice"
        ));
    }

    #[test]
    fn status_code_out_of_range_is_rejected() {
        let spec = ReplySpec {
            status: 42,
            ..ReplySpec::json(200, serde_json::json!({}))
        };
        assert!(matches!(spec.validate(), Err(StubError::InvalidStatus(42))));
    }

    #[test]
    fn bad_regex_fails_validation() {
        let route = RouteMatcher {
            path: Some(PathMatcher::Regex {
                pattern: "([unclosed".to_string(),
            }),
            ..RouteMatcher::default()
        };
        assert!(matches!(
            route.validate(),
            Err(StubError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn bad_base64_body_fails_validation() {
        let spec = ReplySpec {
            body: Some(ReplyBody::Base64 {
                content: "not!!base64".to_string(),
            }),
            ..ReplySpec::json(200, serde_json::json!({}))
        };
        assert!(matches!(spec.validate(), Err(StubError::InvalidBase64(_))));
    }

    #[test]
    fn reply_body_to_bytes() {
        let text = ReplyBody::Text {
            content: "hello".to_string(),
        };
        assert_eq!(text.to_bytes().unwrap(), b"hello");

        let json = ReplyBody::Json {
            content: serde_json::json!({"key": "value"}),
        };
        let bytes = json.to_bytes().unwrap();
        assert!(String::from_utf8(bytes).unwrap().contains("key"));
    }

    #[test]
    fn route_matcher_constructors() {
        let route = RouteMatcher::get("/123/info.0.json");
        assert_eq!(route.method, vec!["GET".to_string()]);
        assert!(matches!(
            route.path,
            Some(PathMatcher::Exact { ref value }) if value == "/123/info.0.json"
        ));

        let route = RouteMatcher::exact("/other");
        assert!(route.method.is_empty());
    }

    #[test]
    fn loads_and_validates_a_config_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
stubs:
  - id: comic
    hold: true
    route:
      path:
        type: exact
        value: /123/info.0.json
    reply:
      status: 200
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.stubs.len(), 1);
        assert!(config.stubs[0].hold);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(
            bad,
            r#"
stubs:
  - id: comic
    route:
      path:
        type: exact
        value: /x
    reply:
      status: 9999
"#
        )
        .unwrap();
        assert!(ServerConfig::from_file(bad.path()).is_err());
    }

    #[test]
    fn shipped_default_config_is_valid() {
        let config: ServerConfig =
            serde_yaml::from_str(include_str!("../demos/default-config.yaml")).unwrap();
        config.validate().unwrap();
        assert!(config.stubs.iter().any(|stub| stub.hold));
    }

    #[test]
    fn settings_defaults() {
        let settings = Settings::default();
        assert!(settings.log_matches);
        assert!(settings.log_unmatched);
        assert!(!settings.passthrough_unmatched);
        assert_eq!(settings.default_content_type, "application/json");
        assert!(settings.upstream.is_none());
    }
}
