#![deny(clippy::pedantic)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use clap::Parser;
use tower_http::timeout::TimeoutLayer;
use tower_layer::layer_fn;
use tracing::{info, instrument};

use git_smart_gateway::controller::GatewayController;
use git_smart_gateway::driver::local::LocalDriver;
use git_smart_gateway::headers::Headers;
use git_smart_gateway::request::{self, RequestData};

use crate::layers::logger::LoggingMiddleware;

mod layers;

/// Serves one or more Git repositories over the Smart-HTTP protocol.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:3333")]
    listen: SocketAddr,

    /// Directory containing the repositories to serve, rooted at this path.
    #[arg(long)]
    repositories: PathBuf,

    /// Per-request deadline; the core has no timeout of its own (§5 leaves
    /// that to the host binding), so it's enforced here.
    #[arg(long, default_value = "60", value_name = "SECONDS")]
    request_timeout: u64,
}

#[tokio::main]
async fn main() {
    let subscriber = tracing_subscriber::fmt();
    #[cfg(debug_assertions)]
    let subscriber = subscriber.pretty();
    subscriber.init();

    let args = Args::parse();

    let controller = Arc::new(GatewayController::new(LocalDriver::new(args.repositories)));
    let _error_log = controller.on_error.subscribe(|err| {
        tracing::error!(error = %err, "driver error");
    });

    let app = Router::new()
        .fallback(handle_git)
        .layer(layer_fn(LoggingMiddleware))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(args.request_timeout),
        ))
        .with_state(controller);

    let listener = tokio::net::TcpListener::bind(args.listen).await.unwrap();
    info!(listen = %args.listen, "git smart-http gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}

#[instrument(skip(controller, request), fields(path = %request.uri().path()))]
async fn handle_git(
    State(controller): State<Arc<GatewayController<LocalDriver>>>,
    request: Request,
) -> Response {
    let method = request.method().to_string();
    let uri = request.uri().clone();
    let content_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(dispatch) = request::dispatch(
        &method,
        uri.path(),
        uri.query().unwrap_or(""),
        content_type.as_deref(),
    ) else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    let mut headers = Headers::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            let _ = headers.append(name.as_str(), value);
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(_) => return (StatusCode::BAD_REQUEST, "Bad Request").into_response(),
    };

    let mut request_data = match RequestData::new(dispatch, headers, body) {
        Ok(request_data) => request_data,
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    };

    let response = match controller.serve(&mut request_data).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "dispatch to observer failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    let mut builder = Response::builder().status(response.status_code);
    for (name, values) in response.headers.iter() {
        for value in values {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::from(response.body)).unwrap()
}
