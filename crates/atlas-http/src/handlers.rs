//! HTTP request handlers.
//!
//! Each handler builds a [`Command`] from the path, query and body, runs it
//! through the dispatcher and shapes the [`Outcome`] into a response.
//! Mutations run detached so a client hanging up mid-request does not cancel
//! a started write.

use std::convert::Infallible;

use atlas_engine::{Caller, Command, Outcome};
use atlas_types::{AccessKey, DatasourceId, Feature, FeatureCollection, Timestamp};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_lite::Stream;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::error::HttpError;

/// `?apikey=` query parameter naming the caller.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiKeyQuery {
    apikey: Option<String>,
}

impl ApiKeyQuery {
    fn caller(&self) -> Result<Caller, HttpError> {
        match self.apikey.as_deref() {
            Some(key) if !key.is_empty() => Ok(Caller::Key(AccessKey::from(key))),
            _ => Err(HttpError::Unauthorized("missing apikey".into())),
        }
    }
}

fn parse_body<T: DeserializeOwned>(what: &str, body: &Bytes) -> Result<T, HttpError> {
    serde_json::from_slice(body).map_err(|e| HttpError::BadRequest(format!("invalid {what}: {e}")))
}

fn ok_data(outcome: &Outcome) -> Response {
    Json(json!({"status": "ok", "data": outcome.to_json()})).into_response()
}

/// Raw GeoJSON body for layer, feature and snapshot reads.
fn raw(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Layer(fc) => Json(fc).into_response(),
        Outcome::Feature(f) => Json(f).into_response(),
        other => Json(other.to_json()).into_response(),
    }
}

async fn read(state: &AppState, caller: &Caller, command: Command) -> Result<Outcome, HttpError> {
    Ok(state.dispatcher.dispatch(caller, command).await?)
}

async fn write(state: &AppState, caller: Caller, command: Command) -> Result<Outcome, HttpError> {
    Ok(state.dispatcher.dispatch_detached(caller, command).await?)
}

// -----------------------------------------------------------------------
// GET /ping
// -----------------------------------------------------------------------

#[tracing::instrument(skip(state))]
pub(crate) async fn ping(State(state): State<AppState>) -> Result<Response, HttpError> {
    let outcome = read(&state, &Caller::Trusted, Command::Ping).await?;
    Ok(ok_data(&outcome))
}

// -----------------------------------------------------------------------
// /api/v1
// -----------------------------------------------------------------------

/// The caller's customer record.
#[tracing::instrument(skip(state))]
pub(crate) async fn get_customer(
    State(state): State<AppState>,
    Query(query): Query<ApiKeyQuery>,
) -> Result<Response, HttpError> {
    let caller = query.caller()?;
    let outcome = read(&state, &caller, Command::ExportApikey { apikey: None }).await?;
    Ok(ok_data(&outcome))
}

/// Create a layer from an optional feature collection body. The caller owns it.
#[tracing::instrument(skip(state, body))]
pub(crate) async fn create_layer(
    State(state): State<AppState>,
    Query(query): Query<ApiKeyQuery>,
    body: Bytes,
) -> Result<Response, HttpError> {
    let caller = query.caller()?;
    let layer = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(parse_body::<FeatureCollection>("feature collection", &body)?)
    };

    let outcome = write(
        &state,
        caller,
        Command::CreateDatasource {
            datasource: None,
            layer,
        },
    )
    .await?;

    match outcome {
        Outcome::Datasource(id) => {
            info!(datasource = %id, "layer created over http");
            Ok(Json(json!({"status": "ok", "datasource": id})).into_response())
        }
        other => Ok(ok_data(&other)),
    }
}

#[tracing::instrument(skip(state))]
pub(crate) async fn get_layer(
    State(state): State<AppState>,
    Path(ds): Path<String>,
    Query(query): Query<ApiKeyQuery>,
) -> Result<Response, HttpError> {
    let caller = query.caller()?;
    let command = Command::ExportDatasource {
        datasource: DatasourceId::from(ds),
    };
    Ok(raw(read(&state, &caller, command).await?))
}

#[tracing::instrument(skip(state))]
pub(crate) async fn delete_layer(
    State(state): State<AppState>,
    Path(ds): Path<String>,
    Query(query): Query<ApiKeyQuery>,
) -> Result<Response, HttpError> {
    let caller = query.caller()?;
    let datasource = DatasourceId::from(ds);
    write(
        &state,
        caller,
        Command::DeleteDatasource {
            datasource: datasource.clone(),
        },
    )
    .await?;
    Ok(Json(json!({"status": "ok", "message": format!("datasource {datasource} deleted")})).into_response())
}

#[tracing::instrument(skip(state))]
pub(crate) async fn get_timestamps(
    State(state): State<AppState>,
    Path(ds): Path<String>,
    Query(query): Query<ApiKeyQuery>,
) -> Result<Response, HttpError> {
    let caller = query.caller()?;
    let command = Command::ExportSnapshots {
        datasource: DatasourceId::from(ds),
    };
    Ok(ok_data(&read(&state, &caller, command).await?))
}

/// The layer as of the latest snapshot at or before `ts` (Unix millis).
#[tracing::instrument(skip(state))]
pub(crate) async fn get_snapshot(
    State(state): State<AppState>,
    Path((ds, ts)): Path<(String, String)>,
    Query(query): Query<ApiKeyQuery>,
) -> Result<Response, HttpError> {
    let caller = query.caller()?;
    let timestamp: Timestamp = ts
        .parse()
        .map_err(|_| HttpError::BadRequest(format!("invalid timestamp: {ts}")))?;
    let command = Command::ExportSnapshot {
        datasource: DatasourceId::from(ds),
        timestamp,
    };
    Ok(raw(read(&state, &caller, command).await?))
}

#[tracing::instrument(skip(state, body))]
pub(crate) async fn insert_feature(
    State(state): State<AppState>,
    Path(ds): Path<String>,
    Query(query): Query<ApiKeyQuery>,
    body: Bytes,
) -> Result<Response, HttpError> {
    let caller = query.caller()?;
    let feature: Feature = parse_body("feature", &body)?;
    let command = Command::InsertFeature {
        datasource: DatasourceId::from(ds),
        feature,
    };
    Ok(ok_data(&write(&state, caller, command).await?))
}

#[tracing::instrument(skip(state))]
pub(crate) async fn get_feature(
    State(state): State<AppState>,
    Path((ds, geo_id)): Path<(String, String)>,
    Query(query): Query<ApiKeyQuery>,
) -> Result<Response, HttpError> {
    let caller = query.caller()?;
    let command = Command::ExportFeature {
        datasource: DatasourceId::from(ds),
        geo_id,
    };
    Ok(raw(read(&state, &caller, command).await?))
}

#[tracing::instrument(skip(state, body))]
pub(crate) async fn edit_feature(
    State(state): State<AppState>,
    Path((ds, geo_id)): Path<(String, String)>,
    Query(query): Query<ApiKeyQuery>,
    body: Bytes,
) -> Result<Response, HttpError> {
    let caller = query.caller()?;
    let feature: Feature = parse_body("feature", &body)?;
    let command = Command::EditFeature {
        datasource: DatasourceId::from(ds),
        geo_id,
        feature,
    };
    Ok(ok_data(&write(&state, caller, command).await?))
}

/// Stream `layer_changed` events for one datasource until the client leaves
/// or the server shuts down.
#[tracing::instrument(skip(state))]
pub(crate) async fn live(
    State(state): State<AppState>,
    Path(ds): Path<String>,
    Query(query): Query<ApiKeyQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, HttpError> {
    let caller = query.caller()?;
    let view = state
        .dispatcher
        .open_view(&caller, DatasourceId::from(ds))
        .await?;
    debug!(conn = %view.id(), "streaming live view");

    let stream = futures_lite::stream::unfold(view, |mut view| async move {
        let change = view.recv().await?;
        let event = Event::default().event("layer_changed");
        let event = match serde_json::to_string(&change) {
            Ok(data) => event.data(data),
            Err(e) => {
                warn!(datasource = %change.datasource, error = %e, "layer change could not be serialized");
                event
            }
        };
        Some((Ok(event), view))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// -----------------------------------------------------------------------
// /management (superuser)
// -----------------------------------------------------------------------

#[tracing::instrument(skip(state))]
pub(crate) async fn create_customer(State(state): State<AppState>) -> Result<Response, HttpError> {
    let outcome = write(&state, Caller::Trusted, Command::CreateApikey).await?;
    if let Outcome::Customer(c) = &outcome {
        info!(apikey = %c.apikey, "customer created over http");
    }
    Ok(ok_data(&outcome))
}

#[tracing::instrument(skip(state))]
pub(crate) async fn list_customers(State(state): State<AppState>) -> Result<Response, HttpError> {
    Ok(ok_data(&read(&state, &Caller::Trusted, Command::ExportApikeys).await?))
}

#[tracing::instrument(skip(state))]
pub(crate) async fn list_datasources(State(state): State<AppState>) -> Result<Response, HttpError> {
    Ok(ok_data(
        &read(&state, &Caller::Trusted, Command::ExportDatasources).await?,
    ))
}

