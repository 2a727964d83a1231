use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use anevt_service::metric;

use crate::service::AppService;

mod error;
mod event;
mod metrics;
mod query;
mod schema;
mod view;

pub use error::ResponseError;
use metrics::MetricsLayer;

use event::ingest_events as event;
use query::{run_query as query, run_query_with_args as query_with_args};
use schema::schema;
use view::{render_view as view, render_view_with_args as view_with_args};

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: AppService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer)
        .layer(DefaultBodyLimit::max(1024 * 1024));
    Router::new()
        .route("/view/{category}/{name}", get(view))
        .route("/view/{category}/{name}/{*args}", get(view_with_args))
        .route("/query/{category}/{name}", get(query))
        .route("/query/{category}/{name}/{*args}", get(query_with_args))
        .route("/schema", get(schema))
        .route("/event", post(event))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
