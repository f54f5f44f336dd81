//! Web server module: exposes the metric sink for scraping.

use crate::metrics::MetricSink;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;

const INDEX_PAGE: &str = r#"<html>
<head><title>Edge Pinger</title></head>
<body>
<h1>Edge Pinger</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>"#;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub sink: MetricSink,
}

/// Web server for the metrics feed.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(port: u16, sink: MetricSink) -> Self {
        Self {
            port,
            state: AppState { sink },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        Router::new()
            .route("/", get(handle_index))
            .route("/metrics", get(handle_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

pub async fn handle_index() -> impl IntoResponse {
    Html(INDEX_PAGE)
}

pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.sink.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricLayout, SeriesLabels};

    #[tokio::test]
    async fn test_metrics_handler() {
        let sink = MetricSink::new(MetricLayout::PerTarget, "edge_pinger").unwrap();
        let Ok(mut metrics) = sink.target_metrics("example.com") else {
            panic!("registration failed");
        };
        metrics
            .healthy
            .set(&SeriesLabels::ok("93.184.216.34", "example.com"), 0.0);

        let response = handle_metrics(State(AppState { sink })).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            prometheus::TEXT_FORMAT
        );
    }

    #[tokio::test]
    async fn test_serves_metrics_over_http() {
        let sink = MetricSink::new(MetricLayout::Shared, "edge_pinger").unwrap();
        let Ok(mut metrics) = sink.target_metrics("example.com") else {
            panic!("registration failed");
        };
        metrics
            .rtt_avg
            .set(&SeriesLabels::ok("93.184.216.34", "example.com"), 11.0);

        let router = Server::new(0, sink).routes();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("edge_pinger_rtt_avg{"));
        assert!(response.contains(r#"hostname="example.com""#));
    }
}
