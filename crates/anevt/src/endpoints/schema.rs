use axum::Json;
use axum::extract::State;

use anevt_service::registry::HandlerInfo;

use crate::service::AppService;

/// Lists every registered view and query.
pub async fn schema(State(service): State<AppService>) -> Json<Vec<HandlerInfo>> {
    Json(service.registry().schema())
}
