//! Demo application under test: a comic viewer with an observable loading
//! state.
//!
//! The viewer is deliberately plain; the scenarios in `tests/` only care
//! about its visible projection: loading first, then exactly one of the two
//! terminal views.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Payload the viewer renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comic {
    pub img: String,
    pub alt: String,
}

/// Visible projection of the viewer's state machine.
///
/// `Loading` is the unique initial state; `Loaded` and `Failed` are the two
/// mutually exclusive terminal states, reachable only from `Loading`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    /// The loading indicator is visible; a request is in flight.
    Loading,
    /// The data view, rendered from the reply.
    Loaded(Comic),
    /// The error view, with a human-readable reason.
    Failed(String),
}

impl ViewState {
    pub fn is_loading(&self) -> bool {
        matches!(self, ViewState::Loading)
    }

    pub fn is_settled(&self) -> bool {
        !self.is_loading()
    }
}

/// View-model that fetches one comic and exposes its state through a watch
/// channel.
pub struct ComicViewer {
    endpoint: String,
    client: reqwest::Client,
    state: watch::Sender<ViewState>,
}

impl ComicViewer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ViewState::Loading);
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            state,
        }
    }

    /// Observable UI state. The loading indicator is visible exactly while
    /// the value is [`ViewState::Loading`].
    pub fn state(&self) -> watch::Receiver<ViewState> {
        self.state.subscribe()
    }

    /// Trigger the data load. The loading state is entered synchronously;
    /// the request itself runs on a spawned task.
    pub fn trigger(&self) -> JoinHandle<()> {
        self.state.send_replace(ViewState::Loading);
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let settled = fetch(&client, &endpoint).await;
            debug!(state = ?settled, "Viewer settled");
            state.send_replace(settled);
        })
    }
}

async fn fetch(client: &reqwest::Client, endpoint: &str) -> ViewState {
    match client.get(endpoint).send().await {
        Ok(response) if response.status().is_success() => {
            match response.json::<Comic>().await {
                Ok(comic) => ViewState::Loaded(comic),
                Err(error) => ViewState::Failed(format!("malformed payload: {error}")),
            }
        }
        Ok(response) => ViewState::Failed(format!(
            "request failed with status {}",
            response.status()
        )),
        Err(error) => ViewState::Failed(format!("request error: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn settled(viewer: &ComicViewer) -> ViewState {
        let mut state = viewer.state();
        let settled = timeout(Duration::from_secs(5), state.wait_for(ViewState::is_settled))
            .await
            .expect("viewer should settle")
            .expect("state channel should stay open")
            .clone();
        settled
    }

    #[tokio::test]
    async fn starts_in_the_loading_state() {
        let viewer = ComicViewer::new("http://127.0.0.1:1/123/info.0.json");
        assert!(viewer.state().borrow().is_loading());
    }

    #[tokio::test]
    async fn successful_fetch_lands_in_the_data_view() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/123/info.0.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "img": "https://imgs.xkcd.com/comics/compiling.png",
                "alt": "Compiling",
            })))
            .mount(&server)
            .await;

        let viewer = ComicViewer::new(format!("{}/123/info.0.json", server.uri()));
        viewer.trigger();

        assert_eq!(
            settled(&viewer).await,
            ViewState::Loaded(Comic {
                img: "https://imgs.xkcd.com/comics/compiling.png".to_string(),
                alt: "Compiling".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn error_reply_lands_in_the_error_view() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/123/info.0.json"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"error": "Not found"})),
            )
            .mount(&server)
            .await;

        let viewer = ComicViewer::new(format!("{}/123/info.0.json", server.uri()));
        viewer.trigger();

        let state = settled(&viewer).await;
        assert!(matches!(&state, ViewState::Failed(reason) if reason.contains("404")));
    }

    #[tokio::test]
    async fn unreachable_endpoint_lands_in_the_error_view() {
        let viewer = ComicViewer::new("http://127.0.0.1:1/123/info.0.json");
        viewer.trigger();

        assert!(matches!(settled(&viewer).await, ViewState::Failed(_)));
    }
}
