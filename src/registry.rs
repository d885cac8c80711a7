//! Stub registry and the deferred dispatch path.
//!
//! [`StubRegistry::register`] installs a held interception and returns the
//! [`ControlHandle`] that releases it. [`StubRegistry::dispatch`] is the
//! transport-facing side: match the captured request, park on the stub's
//! gate, and only then produce the reply. The registry is owned by one
//! scenario and torn down with it; nothing is shared process-wide.

use crate::config::{ReplyBody, ReplySpec, RouteMatcher, Settings, StubDefinition, StubError};
use crate::gate::{ControlHandle, ReleaseGate};
use crate::matcher::{CompiledRoute, MatchContext};
use crate::template::TemplateEngine;
use crate::upstream::{HttpUpstream, Upstream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// An intercepted request, captured at the transport edge.
#[derive(Debug, Clone, Default)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Flattened single-value headers.
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

/// The reply delivered for an intercepted request.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Reply {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Plain-text reply.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain")
            .with_body(body.into().into_bytes())
    }

    /// JSON reply.
    pub fn json(status: u16, content: serde_json::Value) -> Self {
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(content.to_string().into_bytes())
    }

    fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// Dynamic responder: inspects the captured request and produces the reply.
pub type Responder = dyn Fn(&CapturedRequest) -> Reply + Send + Sync;

enum StubAction {
    Canned(ReplySpec),
    Dynamic(Box<Responder>),
    Forward,
}

struct Registration {
    id: String,
    route: CompiledRoute,
    action: StubAction,
    gate: ReleaseGate,
    enabled: bool,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
    parked: AtomicU64,
    registered: AtomicU64,
}

/// Point-in-time view of the registry's request counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub matched: u64,
    pub unmatched: u64,
    /// Requests currently suspended on an unreleased gate.
    pub parked: u64,
    pub stubs: u64,
}

/// Registry of stubs for one scenario.
pub struct StubRegistry {
    stubs: RwLock<Vec<Arc<Registration>>>,
    /// Handles for config-installed held stubs, releasable by id.
    held: RwLock<HashMap<String, ControlHandle>>,
    settings: Settings,
    upstream: Option<Arc<dyn Upstream>>,
    default_reply: Option<ReplySpec>,
    templates: TemplateEngine,
    counters: Counters,
    next_anonymous: AtomicU64,
}

impl StubRegistry {
    /// Create a registry. When `settings.upstream` is set, pass-through
    /// stubs forward to it over HTTP.
    pub fn new(settings: Settings) -> Self {
        let upstream = settings
            .upstream
            .as_deref()
            .map(|origin| Arc::new(HttpUpstream::new(origin)) as Arc<dyn Upstream>);
        Self {
            stubs: RwLock::new(Vec::new()),
            held: RwLock::new(HashMap::new()),
            settings,
            upstream,
            default_reply: None,
            templates: TemplateEngine::new(),
            counters: Counters::default(),
            next_anonymous: AtomicU64::new(0),
        }
    }

    /// Replace the upstream used for pass-through stubs.
    pub fn with_upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Reply sent when no stub matches, instead of the built-in 404.
    pub fn with_default_reply(mut self, reply: ReplySpec) -> Self {
        self.default_reply = Some(reply);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Register a held interception.
    ///
    /// A matching request is parked until the returned handle is released.
    /// With a reply spec the canned reply is delivered on release; without
    /// one the request is forwarded to the upstream, whose answer is
    /// captured and held until release.
    pub async fn register(
        &self,
        route: RouteMatcher,
        reply: Option<ReplySpec>,
    ) -> Result<ControlHandle, StubError> {
        let id = self.anonymous_id();
        let action = match reply {
            Some(spec) => {
                spec.validate()?;
                StubAction::Canned(spec)
            }
            None => {
                if self.upstream.is_none() {
                    return Err(StubError::MissingUpstream(id));
                }
                StubAction::Forward
            }
        };
        self.insert(id, route, action).await
    }

    /// Register a held interception with a dynamic responder.
    pub async fn register_fn(
        &self,
        route: RouteMatcher,
        responder: impl Fn(&CapturedRequest) -> Reply + Send + Sync + 'static,
    ) -> Result<ControlHandle, StubError> {
        let id = self.anonymous_id();
        self.insert(id, route, StubAction::Dynamic(Box::new(responder)))
            .await
    }

    /// Install a config-defined stub. Held stubs keep their handle in the
    /// registry so they can be released by id; the rest answer immediately.
    pub async fn install(&self, definition: &StubDefinition) -> Result<(), StubError> {
        definition.validate()?;
        let action = match &definition.reply {
            Some(spec) => StubAction::Canned(spec.clone()),
            None => {
                if self.upstream.is_none() {
                    return Err(StubError::MissingUpstream(definition.id.clone()));
                }
                StubAction::Forward
            }
        };
        let route = CompiledRoute::compile(&definition.route)?;
        let gate = if definition.hold {
            let (handle, gate) = ReleaseGate::new();
            self.held.write().await.insert(definition.id.clone(), handle);
            gate
        } else {
            ReleaseGate::open()
        };

        self.push(Registration {
            id: definition.id.clone(),
            route,
            action,
            gate,
            enabled: definition.enabled,
        })
        .await;
        info!(
            stub_id = %definition.id,
            hold = definition.hold,
            "Installed stub"
        );
        Ok(())
    }

    /// Release a config-installed held stub by id.
    pub async fn release(&self, id: &str) -> bool {
        match self.held.read().await.get(id) {
            Some(handle) => {
                handle.release();
                info!(stub_id = %id, "Stub released");
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_total: self.counters.total.load(Ordering::Relaxed),
            matched: self.counters.matched.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            parked: self.counters.parked.load(Ordering::Relaxed),
            stubs: self.counters.registered.load(Ordering::Relaxed),
        }
    }

    /// Match, park, and produce the reply for an intercepted request.
    pub async fn dispatch(&self, request: CapturedRequest) -> Reply {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let Some((registration, context)) = self.find_match(&request).await else {
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            if self.settings.log_unmatched {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    "No matching stub"
                );
            }
            return self.unmatched_reply(&request).await;
        };

        self.counters.matched.fetch_add(1, Ordering::Relaxed);
        if self.settings.log_matches {
            info!(
                stub_id = %registration.id,
                method = %request.method,
                path = %request.path,
                held = !registration.gate.is_open(),
                "Request matched stub"
            );
        }

        self.produce(&registration, &context, &request).await
    }

    fn anonymous_id(&self) -> String {
        format!(
            "held-{}",
            self.next_anonymous.fetch_add(1, Ordering::Relaxed) + 1
        )
    }

    async fn insert(
        &self,
        id: String,
        route: RouteMatcher,
        action: StubAction,
    ) -> Result<ControlHandle, StubError> {
        let route = CompiledRoute::compile(&route)?;
        let (handle, gate) = ReleaseGate::new();
        self.push(Registration {
            id: id.clone(),
            route,
            action,
            gate,
            enabled: true,
        })
        .await;
        debug!(stub_id = %id, "Registered held stub");
        Ok(handle)
    }

    async fn push(&self, registration: Registration) {
        self.stubs.write().await.push(Arc::new(registration));
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
    }

    async fn find_match(
        &self,
        request: &CapturedRequest,
    ) -> Option<(Arc<Registration>, MatchContext)> {
        let stubs = self.stubs.read().await;
        // Newest registration wins when several stubs cover the same route.
        for registration in stubs.iter().rev() {
            if !registration.enabled {
                continue;
            }
            if let Some(context) = registration.route.matches(
                &request.method,
                &request.path,
                request.query.as_deref(),
                &request.headers,
            ) {
                return Some((Arc::clone(registration), context));
            }
        }
        None
    }

    /// Park on the gate, then materialize the reply. Nothing about the
    /// reply is evaluated before the gate fires, so a pending-state
    /// assertion sequenced before release always observes an unanswered
    /// request.
    async fn produce(
        &self,
        registration: &Registration,
        context: &MatchContext,
        request: &CapturedRequest,
    ) -> Reply {
        self.counters.parked.fetch_add(1, Ordering::Relaxed);
        let reply = match &registration.action {
            StubAction::Canned(spec) => {
                registration.gate.released().await;
                self.materialize(spec, context, request)
            }
            StubAction::Dynamic(responder) => {
                registration.gate.released().await;
                responder(request)
            }
            StubAction::Forward => match &self.upstream {
                Some(upstream) => {
                    // The upstream answers concurrently with the wait; the
                    // captured result is surrendered only once the gate
                    // has fired.
                    let (result, ()) =
                        tokio::join!(upstream.forward(request), registration.gate.released());
                    match result {
                        Ok(reply) => reply,
                        Err(error) => {
                            warn!(
                                stub_id = %registration.id,
                                %error,
                                "Upstream request failed"
                            );
                            Reply::text(502, format!("upstream request failed: {error}"))
                        }
                    }
                }
                None => {
                    registration.gate.released().await;
                    Reply::text(502, "no upstream configured")
                }
            },
        };
        self.counters.parked.fetch_sub(1, Ordering::Relaxed);
        debug!(
            stub_id = %registration.id,
            status = reply.status,
            "Releasing reply"
        );
        reply
    }

    fn materialize(
        &self,
        spec: &ReplySpec,
        context: &MatchContext,
        request: &CapturedRequest,
    ) -> Reply {
        let content_type = spec
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| {
                spec.body
                    .as_ref()
                    .map(|body| body.content_type().to_string())
                    .unwrap_or_else(|| self.settings.default_content_type.clone())
            });

        let mut reply = Reply::new(spec.status).with_header("content-type", content_type);
        for (name, value) in &spec.headers {
            if !name.eq_ignore_ascii_case("content-type") {
                reply = reply.with_header(name, value);
            }
        }
        reply.body = spec
            .body
            .as_ref()
            .and_then(|body| self.body_bytes(spec, body, context, request));
        reply
    }

    fn body_bytes(
        &self,
        spec: &ReplySpec,
        body: &ReplyBody,
        context: &MatchContext,
        request: &CapturedRequest,
    ) -> Option<Vec<u8>> {
        if spec.template {
            match self.render_body(body, context, request) {
                Ok(bytes) => return Some(bytes),
                Err(error) => {
                    warn!(%error, "Template rendering failed, sending raw body");
                }
            }
        }
        match body.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(error) => {
                warn!(%error, "Could not materialize reply body");
                None
            }
        }
    }

    fn render_body(
        &self,
        body: &ReplyBody,
        context: &MatchContext,
        request: &CapturedRequest,
    ) -> anyhow::Result<Vec<u8>> {
        match body {
            ReplyBody::Text { content } => Ok(self
                .templates
                .render(
                    content,
                    context,
                    &request.method,
                    &request.path,
                    &request.headers,
                )?
                .into_bytes()),
            ReplyBody::Json { content } => {
                let rendered = self.templates.render_json(
                    content,
                    context,
                    &request.method,
                    &request.path,
                    &request.headers,
                )?;
                Ok(serde_json::to_vec(&rendered)?)
            }
            other => other.to_bytes(),
        }
    }

    async fn unmatched_reply(&self, request: &CapturedRequest) -> Reply {
        if self.settings.passthrough_unmatched {
            if let Some(upstream) = &self.upstream {
                debug!(path = %request.path, "Forwarding unmatched request upstream");
                return match upstream.forward(request).await {
                    Ok(reply) => reply,
                    Err(error) => {
                        warn!(%error, "Upstream request failed");
                        Reply::text(502, format!("upstream request failed: {error}"))
                    }
                };
            }
            warn!("passthrough_unmatched is set but no upstream is configured");
        }
        if let Some(default) = &self.default_reply {
            return self.materialize(default, &MatchContext::default(), request);
        }
        Reply::json(
            404,
            serde_json::json!({"error": "not_found", "message": "No matching stub"}),
        )
    }
}
