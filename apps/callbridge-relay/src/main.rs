mod cli;
mod config;
mod handlers;
mod websocket;

use anyhow::Context;
use axum::{routing::get, Router};
use callbridge::relay::RelayHub;
use callbridge::telemetry;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    handlers::{get_call_status, health_check, metrics_handler, AppState},
    websocket::websocket_handler,
};

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/calls/:call_id", get(get_call_status))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn serve(mut config: Config, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.port = port;
    }
    let hub = RelayHub::new(config.hub());
    let sweeper = hub.spawn_sweeper();
    info!(
        "starting callbridge relay {} on port {} (stale after {}s)",
        hub.instance_id(),
        config.port,
        config.stale_after_secs
    );

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("callbridge relay listening on {}", addr);

    axum::serve(listener, router(AppState { hub }))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("relay server failed")?;
    sweeper.abort();
    info!("callbridge relay stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    telemetry::init_tracing(&config.log_filter);

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Probe { url, timeout_secs }) => cli::run_probe(url, timeout_secs).await,
        Some(Commands::Serve { port }) => serve(config, port).await,
        None => serve(config, None).await,
    };
    if let Err(err) = result {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use callbridge::protocol::{ClientFrame, ParticipantRole};
    use callbridge::{CallId, ParticipantId};
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn health_reports_the_relay_instance() {
        let hub = RelayHub::default();
        let (status, body) = get_json(router(AppState { hub: hub.clone() }), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["relay_instance"], hub.instance_id());
        assert_eq!(body["connections"], 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn call_status_lists_joined_participants() {
        let hub = RelayHub::default();
        let app = router(AppState { hub: hub.clone() });

        let (status, _) = get_json(app.clone(), "/calls/c-missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let attachment = hub.attach().unwrap();
        assert!(hub.handle_frame(
            attachment.connection_id,
            ClientFrame::Join {
                call_id: CallId::from("c-1"),
                participant_id: ParticipantId::from("tv"),
                role: ParticipantRole::Target,
            },
        ));
        let (status, body) = get_json(app, "/calls/c-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["call_id"], "c-1");
        assert_eq!(body["participants"][0]["role"], "target");
        assert_eq!(body["participants"][0]["participant_id"], "tv");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn metrics_are_exposed_as_prometheus_text() {
        let hub = RelayHub::default();
        let _attachment = hub.attach().unwrap();
        let response = router(AppState { hub })
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("callbridge_hub_connections"));
    }
}
