use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use crate::service::RequestService;

mod capabilities;
mod error;
mod execution;
mod metrics;

pub use error::ResponseError;
use metrics::track_metrics;

use capabilities::{get_default_capabilities, get_instance_capabilities};
use execution::{execute, wait_execution};

pub async fn healthcheck() -> &'static str {
    buildgate_service::metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: RequestService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(middleware::from_fn(track_metrics));
    Router::new()
        .route("/capabilities", get(get_default_capabilities))
        .route("/capabilities/*instance", get(get_instance_capabilities))
        .route("/execute", post(execute))
        .route("/operations/*name", post(wait_execution))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
