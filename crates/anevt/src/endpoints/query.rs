use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde_json::Value;

use anevt_service::caching::QueryArgs;
use anevt_service::metric;

use super::ResponseError;
use crate::service::AppService;

/// How a request wants its result produced, from the reserved `mode` query
/// parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Cached result, in-flight computation, or compute.
    Default,
    /// Always recompute, refreshing the cache.
    Recompute,
    /// Serve from cache only; 503 when nothing is cached.
    Cached,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Default => "default",
            Mode::Recompute => "recompute",
            Mode::Cached => "cached",
        }
    }
}

/// Turns path segments and query parameters into handler arguments.
///
/// Path segments become positional string arguments, query parameters become
/// keyword arguments. The `mode` parameter is reserved and never reaches the
/// handler.
pub fn build_args(
    raw: Option<&str>,
    mut params: BTreeMap<String, String>,
) -> Result<(Mode, QueryArgs), ResponseError> {
    let mode = match params.remove("mode").as_deref() {
        None | Some("default") => Mode::Default,
        Some("recompute") => Mode::Recompute,
        Some("cached") => Mode::Cached,
        Some(_) => return Err((StatusCode::BAD_REQUEST, "unknown mode").into()),
    };

    let mut args = QueryArgs::new();
    if let Some(raw) = raw {
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            args = args.with_arg(segment);
        }
    }
    for (name, value) in params {
        args = args.with_kwarg(name, value);
    }
    Ok((mode, args))
}

pub async fn run_query(
    State(service): State<AppService>,
    Path((category, name)): Path<(String, String)>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Value>, ResponseError> {
    run(service, category, name, None, params).await
}

pub async fn run_query_with_args(
    State(service): State<AppService>,
    Path((category, name, args)): Path<(String, String, String)>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Value>, ResponseError> {
    run(service, category, name, Some(args), params).await
}

async fn run(
    service: AppService,
    category: String,
    name: String,
    raw_args: Option<String>,
    params: BTreeMap<String, String>,
) -> Result<Json<Value>, ResponseError> {
    let handler = service
        .registry()
        .query(&category, &name)
        .ok_or((StatusCode::NOT_FOUND, "no such query"))?;

    let (mode, args) = build_args(raw_args.as_deref(), params)?;
    metric!(counter("endpoints.query") += 1, "mode" => mode.as_str());

    let value = match mode {
        Mode::Default => handler.call(args).await?,
        Mode::Recompute => handler.force_recompute(args).await?,
        Mode::Cached => handler.force_retrieve(args).await?,
    };
    Ok(Json(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args() {
        let params = BTreeMap::from([
            ("mode".to_owned(), "cached".to_owned()),
            ("resolution".to_owned(), "day".to_owned()),
        ]);
        let (mode, args) = build_args(Some("video/7"), params).unwrap();
        assert_eq!(mode, Mode::Cached);
        assert_eq!(args.positional.len(), 2);
        assert_eq!(args.positional[0].value(), "video");
        assert_eq!(args.keyword["resolution"].value(), "day");
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let params = BTreeMap::from([("mode".to_owned(), "sideways".to_owned())]);
        assert!(build_args(None, params).is_err());
    }
}
