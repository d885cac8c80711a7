//! Held Mock Server
//!
//! A mock server whose stub replies can be parked until the caller releases
//! them. Built for deterministically testing a UI's transient loading state:
//! intercept the request the application makes, assert the loading indicator
//! while the reply is parked, release it, then assert the settled view. The
//! reply physically cannot arrive before the release, so no delay tuning and
//! no polling is involved.
//!
//! # Features
//!
//! - **Held stubs**: `register` parks matching requests and returns a
//!   [`ControlHandle`] whose single `release()` lets the reply go
//! - **Request matching**: match by path (exact, prefix, regex, glob,
//!   template), method, headers, query params
//! - **Canned replies**: fixed status, headers, and body
//! - **Dynamic replies**: responder closures, or Handlebars templates for
//!   config-declared stubs
//! - **Pass-through**: forward to the real origin and gate delivery of the
//!   captured response
//! - **Control surface**: release config-held stubs and read request
//!   counters over HTTP (`/__held/`)
//!
//! # Example Configuration
//!
//! ```yaml
//! stubs:
//!   - id: comic
//!     hold: true
//!     route:
//!       method: [GET]
//!       path:
//!         type: exact
//!         value: /123/info.0.json
//!     reply:
//!       status: 200
//!       body:
//!         type: json
//!         content:
//!           img: "https://imgs.xkcd.com/comics/compiling.png"
//!           alt: "Compiling"
//! ```

pub mod app;
pub mod config;
pub mod gate;
pub mod matcher;
pub mod registry;
pub mod server;
pub mod template;
pub mod upstream;

pub use app::{Comic, ComicViewer, ViewState};
pub use config::{
    ReplyBody, ReplySpec, RouteMatcher, ServerConfig, Settings, StubDefinition, StubError,
};
pub use gate::{ControlHandle, ReleaseGate};
pub use registry::{CapturedRequest, Reply, StatsSnapshot, StubRegistry};
pub use server::{HeldMockServer, ServerError};
pub use upstream::{HttpUpstream, Upstream, UpstreamError};
