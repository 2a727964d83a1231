use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use serde_json::Value;

use anevt_service::metric;

use super::ResponseError;
use super::query::{Mode, build_args};
use crate::service::AppService;

pub async fn render_view(
    State(service): State<AppService>,
    Path((category, name)): Path<(String, String)>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Html<String>, ResponseError> {
    render(service, category, name, None, params).await
}

pub async fn render_view_with_args(
    State(service): State<AppService>,
    Path((category, name, args)): Path<(String, String, String)>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Html<String>, ResponseError> {
    render(service, category, name, Some(args), params).await
}

async fn render(
    service: AppService,
    category: String,
    name: String,
    raw_args: Option<String>,
    params: BTreeMap<String, String>,
) -> Result<Html<String>, ResponseError> {
    let handler = service
        .registry()
        .view(&category, &name)
        .ok_or((StatusCode::NOT_FOUND, "no such view"))?;

    let (mode, args) = build_args(raw_args.as_deref(), params)?;
    metric!(counter("endpoints.view") += 1, "mode" => mode.as_str());

    let value = match mode {
        Mode::Default => handler.call(args).await?,
        Mode::Recompute => handler.force_recompute(args).await?,
        Mode::Cached => handler.force_retrieve(args).await?,
    };

    // Views return their markup as a JSON string; anything else is rendered
    // as a preformatted JSON dump.
    let html = match value {
        Value::String(html) => html,
        other => format!(
            "<pre>{}</pre>",
            escape_html(&serde_json::to_string_pretty(&other)?)
        ),
    };
    Ok(Html(html))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
