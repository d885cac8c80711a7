//! Compiled route matching.
//!
//! Every pattern in a [`RouteMatcher`] is compiled when the stub is
//! registered; a pattern that does not compile is a registration error, so
//! the match path itself is infallible.

use crate::config::{HeaderMatcher, PathMatcher, QueryMatcher, RouteMatcher, StubError};
use regex::Regex;
use std::collections::HashMap;

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Path parameters extracted from template matching
    pub path_params: HashMap<String, String>,
    /// Query parameters
    pub query_params: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
}

/// A route with all of its patterns compiled.
#[derive(Debug)]
pub struct CompiledRoute {
    methods: Vec<String>,
    path: Option<CompiledPath>,
    query: Vec<(String, CompiledValue)>,
    headers: Vec<(String, CompiledValue)>,
}

#[derive(Debug)]
enum CompiledPath {
    Exact(String),
    Prefix(String),
    Regex(Regex),
    Glob(globset::GlobMatcher),
    Template(Vec<Segment>),
}

#[derive(Debug)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Compiled form shared by query and header value matchers.
#[derive(Debug)]
enum CompiledValue {
    Exact(String),
    Regex(Regex),
    Present,
    Absent,
    Contains(String),
}

impl CompiledValue {
    fn matches(&self, value: Option<&str>) -> bool {
        match self {
            CompiledValue::Exact(expected) => value == Some(expected.as_str()),
            CompiledValue::Regex(regex) => value.is_some_and(|v| regex.is_match(v)),
            CompiledValue::Present => value.is_some(),
            CompiledValue::Absent => value.is_none(),
            CompiledValue::Contains(needle) => value.is_some_and(|v| v.contains(needle)),
        }
    }
}

impl CompiledRoute {
    /// Compile a route matcher, rejecting any pattern that does not parse.
    pub fn compile(route: &RouteMatcher) -> Result<Self, StubError> {
        let path = route.path.as_ref().map(compile_path).transpose()?;

        let query = route
            .query
            .iter()
            .map(|(name, matcher)| {
                let compiled = match matcher {
                    QueryMatcher::Exact { value } => CompiledValue::Exact(value.clone()),
                    QueryMatcher::Regex { pattern } => CompiledValue::Regex(compile_regex(pattern)?),
                    QueryMatcher::Present => CompiledValue::Present,
                    QueryMatcher::Absent => CompiledValue::Absent,
                };
                Ok((name.clone(), compiled))
            })
            .collect::<Result<Vec<_>, StubError>>()?;

        let headers = route
            .headers
            .iter()
            .map(|(name, matcher)| {
                let compiled = match matcher {
                    HeaderMatcher::Exact { value } => CompiledValue::Exact(value.clone()),
                    HeaderMatcher::Regex { pattern } => {
                        CompiledValue::Regex(compile_regex(pattern)?)
                    }
                    HeaderMatcher::Present => CompiledValue::Present,
                    HeaderMatcher::Absent => CompiledValue::Absent,
                    HeaderMatcher::Contains { value } => CompiledValue::Contains(value.clone()),
                };
                Ok((name.clone(), compiled))
            })
            .collect::<Result<Vec<_>, StubError>>()?;

        Ok(Self {
            methods: route.method.clone(),
            path,
            query,
            headers,
        })
    }

    /// Match a captured request, returning the extracted context on success.
    pub fn matches(
        &self,
        method: &str,
        path: &str,
        query: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Option<MatchContext> {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
        {
            return None;
        }

        let mut context = MatchContext::default();

        if let Some(matcher) = &self.path {
            if !matcher.matches(path, &mut context) {
                return None;
            }
        }

        context.query_params = parse_query(query.unwrap_or(""));

        for (name, matcher) in &self.query {
            let value = context.query_params.get(name).map(String::as_str);
            if !matcher.matches(value) {
                return None;
            }
        }

        for (name, matcher) in &self.headers {
            let value = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str());
            if !matcher.matches(value) {
                return None;
            }
        }

        Some(context)
    }
}

impl CompiledPath {
    fn matches(&self, path: &str, context: &mut MatchContext) -> bool {
        match self {
            CompiledPath::Exact(value) => path == value,
            CompiledPath::Prefix(value) => path.starts_with(value),
            CompiledPath::Regex(regex) => {
                let Some(captures) = regex.captures(path) else {
                    return false;
                };
                for (i, capture) in captures.iter().enumerate().skip(1) {
                    if let Some(m) = capture {
                        context.captures.insert(i.to_string(), m.as_str().to_string());
                    }
                }
                for name in regex.capture_names().flatten() {
                    if let Some(m) = captures.name(name) {
                        context.captures.insert(name.to_string(), m.as_str().to_string());
                    }
                }
                true
            }
            CompiledPath::Glob(glob) => glob.is_match(path),
            CompiledPath::Template(segments) => {
                let Some(params) = match_template(segments, path) else {
                    return false;
                };
                context.path_params = params;
                true
            }
        }
    }
}

fn compile_path(matcher: &PathMatcher) -> Result<CompiledPath, StubError> {
    Ok(match matcher {
        PathMatcher::Exact { value } => CompiledPath::Exact(value.clone()),
        PathMatcher::Prefix { value } => CompiledPath::Prefix(value.clone()),
        PathMatcher::Regex { pattern } => CompiledPath::Regex(compile_regex(pattern)?),
        PathMatcher::Glob { pattern } => {
            let glob = globset::Glob::new(pattern).map_err(|source| StubError::InvalidGlob {
                pattern: pattern.clone(),
                source,
            })?;
            CompiledPath::Glob(glob.compile_matcher())
        }
        PathMatcher::Template { template } => CompiledPath::Template(parse_template(template)),
    })
}

fn compile_regex(pattern: &str) -> Result<Regex, StubError> {
    Regex::new(pattern).map_err(|source| StubError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })
}

/// Split a template like `/comics/{num}/info.0.json` into segments.
fn parse_template(template: &str) -> Vec<Segment> {
    template
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            match segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
            {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(segment.to_string()),
            }
        })
        .collect()
}

/// Segment-wise template match; each `{param}` binds exactly one segment.
fn match_template(segments: &[Segment], path: &str) -> Option<HashMap<String, String>> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() != segments.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (segment, part) in segments.iter().zip(&parts) {
        match segment {
            Segment::Literal(literal) if literal == part => {}
            Segment::Literal(_) => return None,
            Segment::Param(name) => {
                params.insert(name.clone(), (*part).to_string());
            }
        }
    }
    Some(params)
}

/// Decode a query string into key-value pairs.
fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathMatcher;

    fn compile(route: RouteMatcher) -> CompiledRoute {
        CompiledRoute::compile(&route).unwrap()
    }

    fn path_route(path: PathMatcher) -> CompiledRoute {
        compile(RouteMatcher {
            path: Some(path),
            ..RouteMatcher::default()
        })
    }

    #[test]
    fn exact_path_matching() {
        let route = path_route(PathMatcher::Exact {
            value: "/123/info.0.json".to_string(),
        });

        assert!(route
            .matches("GET", "/123/info.0.json", None, &HashMap::new())
            .is_some());
        assert!(route
            .matches("GET", "/124/info.0.json", None, &HashMap::new())
            .is_none());
    }

    #[test]
    fn prefix_path_matching() {
        let route = path_route(PathMatcher::Prefix {
            value: "/api/".to_string(),
        });

        assert!(route.matches("GET", "/api/comics", None, &HashMap::new()).is_some());
        assert!(route
            .matches("GET", "/api/comics/123", None, &HashMap::new())
            .is_some());
        assert!(route.matches("GET", "/other", None, &HashMap::new()).is_none());
    }

    #[test]
    fn template_path_matching_extracts_params() {
        let route = path_route(PathMatcher::Template {
            template: "/{num}/info.0.json".to_string(),
        });

        let context = route
            .matches("GET", "/123/info.0.json", None, &HashMap::new())
            .unwrap();
        assert_eq!(context.path_params.get("num"), Some(&"123".to_string()));

        assert!(route
            .matches("GET", "/123/extra/info.0.json", None, &HashMap::new())
            .is_none());
    }

    #[test]
    fn regex_path_matching_collects_captures() {
        let route = path_route(PathMatcher::Regex {
            pattern: r"^/comics/(?P<num>\d+)$".to_string(),
        });

        let context = route.matches("GET", "/comics/42", None, &HashMap::new()).unwrap();
        assert_eq!(context.captures.get("num"), Some(&"42".to_string()));
        assert_eq!(context.captures.get("1"), Some(&"42".to_string()));

        assert!(route
            .matches("GET", "/comics/none", None, &HashMap::new())
            .is_none());
    }

    #[test]
    fn glob_path_matching() {
        let route = path_route(PathMatcher::Glob {
            pattern: "/static/*.png".to_string(),
        });

        assert!(route
            .matches("GET", "/static/compiling.png", None, &HashMap::new())
            .is_some());
        assert!(route
            .matches("GET", "/static/compiling.jpg", None, &HashMap::new())
            .is_none());
    }

    #[test]
    fn method_matching_is_case_insensitive() {
        let route = compile(RouteMatcher {
            method: vec!["get".to_string(), "POST".to_string()],
            path: Some(PathMatcher::Exact {
                value: "/api".to_string(),
            }),
            ..RouteMatcher::default()
        });

        assert!(route.matches("GET", "/api", None, &HashMap::new()).is_some());
        assert!(route.matches("post", "/api", None, &HashMap::new()).is_some());
        assert!(route.matches("DELETE", "/api", None, &HashMap::new()).is_none());
    }

    #[test]
    fn query_matching() {
        let mut query = HashMap::new();
        query.insert(
            "page".to_string(),
            crate::config::QueryMatcher::Exact {
                value: "1".to_string(),
            },
        );
        query.insert("token".to_string(), crate::config::QueryMatcher::Present);
        let route = compile(RouteMatcher {
            query,
            ..RouteMatcher::default()
        });

        assert!(route
            .matches("GET", "/", Some("page=1&token=abc"), &HashMap::new())
            .is_some());
        assert!(route
            .matches("GET", "/", Some("page=2&token=abc"), &HashMap::new())
            .is_none());
        assert!(route.matches("GET", "/", Some("page=1"), &HashMap::new()).is_none());
    }

    #[test]
    fn query_values_are_percent_decoded() {
        let route = compile(RouteMatcher::default());
        let context = route
            .matches("GET", "/", Some("name=John%20Doe&flag"), &HashMap::new())
            .unwrap();
        assert_eq!(context.query_params.get("name"), Some(&"John Doe".to_string()));
        assert_eq!(context.query_params.get("flag"), Some(&String::new()));
    }

    #[test]
    fn header_matching_ignores_name_case() {
        let mut matchers = HashMap::new();
        matchers.insert("authorization".to_string(), crate::config::HeaderMatcher::Present);
        matchers.insert(
            "accept".to_string(),
            crate::config::HeaderMatcher::Contains {
                value: "json".to_string(),
            },
        );
        let route = compile(RouteMatcher {
            headers: matchers,
            ..RouteMatcher::default()
        });

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer token".to_string());
        headers.insert("Accept".to_string(), "application/json".to_string());
        assert!(route.matches("GET", "/", None, &headers).is_some());

        headers.remove("Authorization");
        assert!(route.matches("GET", "/", None, &headers).is_none());
    }

    #[test]
    fn invalid_patterns_fail_compilation() {
        let route = RouteMatcher {
            path: Some(PathMatcher::Regex {
                pattern: "([unclosed".to_string(),
            }),
            ..RouteMatcher::default()
        };
        assert!(matches!(
            CompiledRoute::compile(&route),
            Err(StubError::InvalidRegex { .. })
        ));
    }
}
