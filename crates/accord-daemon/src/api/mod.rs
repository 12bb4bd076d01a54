//! The local node-configuration REST API.
//!
//! A small axum application bound to localhost: node registration and
//! configuration state (`/node`, `/configstate`), service attribute CRUD
//! (`/attribute`), and the operator event log (`/eventlog`). The worker
//! collective is synchronous; this server runs on its own thread with a
//! dedicated single-threaded runtime.
//!
//! Input rejections come back as 400 with `{error, input}` naming the
//! offending field; they are operator mistakes, not system errors, and
//! are logged below ERROR.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use accord_core::attributes::Attribute;
use accord_core::events::Event;
use accord_core::persistence::records::{ConfigState, EventLogRecord, NodeRecord};
use accord_core::persistence::Store;

use crate::runtime::MessageBus;

/// Shared state of the API handlers.
#[derive(Clone)]
pub struct ApiState {
    /// The embedded store.
    pub store: Arc<Store>,
    /// The event bus, for lifecycle notifications.
    pub bus: Arc<MessageBus>,
}

/// The standard error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// What was wrong.
    pub error: String,
    /// The field or input the error refers to.
    pub input: String,
}

fn user_error(error: impl Into<String>, input: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: error.into(),
        input: input.into(),
    };
    warn!(error = %body.error, input = %body.input, "rejected API input");
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn system_error(err: impl std::fmt::Display) -> Response {
    error!(%err, "API operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
            input: String::new(),
        }),
    )
        .into_response()
}

/// Builds the router.
#[must_use]
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/node",
            get(get_node).post(post_node).delete(delete_node),
        )
        .route("/configstate", get(get_configstate).put(put_configstate))
        .route("/attribute", get(list_attributes).post(post_attribute))
        .route("/attribute/:id", axum::routing::delete(delete_attribute))
        .route("/eventlog", get(get_eventlog))
        .with_state(state)
}

/// Runs the API server on a dedicated thread until the process exits.
pub fn spawn(listen: String, state: ApiState) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("api".to_string())
        .spawn(move || {
            // One current-thread runtime; the rest of the daemon stays
            // synchronous.
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!(%err, "API runtime construction failed");
                    return;
                }
            };
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::bind(&listen).await {
                    Ok(listener) => listener,
                    Err(err) => {
                        error!(%listen, %err, "API bind failed");
                        return;
                    }
                };
                info!(%listen, "configuration API listening");
                if let Err(err) = axum::serve(listener, router(state)).await {
                    error!(%err, "API server exited");
                }
            });
        })
        .expect("spawning a thread only fails when the process is out of resources")
}

// ---- /node --------------------------------------------------------------

#[derive(Debug, Serialize)]
struct NodeView {
    org: String,
    id: String,
    name: String,
    pattern: Option<String>,
    #[serde(rename = "configstate")]
    config_state: ConfigStateView,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfigStateView {
    state: String,
}

impl From<&NodeRecord> for NodeView {
    fn from(node: &NodeRecord) -> Self {
        Self {
            org: node.org.clone(),
            id: node.id.clone(),
            name: node.name.clone(),
            pattern: node.pattern.clone(),
            config_state: ConfigStateView {
                state: node.config_state.to_string(),
            },
        }
    }
}

async fn get_node(State(state): State<ApiState>) -> Response {
    match state.store.find_node() {
        Ok(Some(node)) => (StatusCode::OK, Json(NodeView::from(&node))).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => system_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct NodeRegistration {
    org: String,
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    pattern: Option<String>,
}

async fn post_node(State(state): State<ApiState>, Json(body): Json<NodeRegistration>) -> Response {
    if body.org.is_empty() {
        return user_error("organization must not be empty", "node.org");
    }
    if body.id.is_empty() {
        return user_error("node id must not be empty", "node.id");
    }
    match state.store.find_node() {
        Ok(Some(existing)) => {
            if existing.org == body.org && existing.id == body.id {
                // Re-registration of the same node is a noop.
                return (StatusCode::OK, Json(NodeView::from(&existing))).into_response();
            }
            user_error(
                "node is already registered with a different identity",
                "node.id",
            )
        }
        Ok(None) => {
            let node = NodeRecord {
                org: body.org.clone(),
                id: body.id.clone(),
                name: body.name,
                token: body.token,
                pattern: body.pattern.clone(),
                config_state: ConfigState::Configuring,
            };
            if let Err(err) = state.store.save_node(&node) {
                return system_error(err);
            }
            state.bus.publish(Event::NodeRegistered {
                org: body.org,
                id: body.id,
                pattern: body.pattern,
            });
            (StatusCode::CREATED, Json(NodeView::from(&node))).into_response()
        }
        Err(err) => system_error(err),
    }
}

async fn delete_node(State(state): State<ApiState>) -> Response {
    match state.store.find_node() {
        Ok(Some(_)) => {
            state.bus.publish(Event::NodeUnconfiguring);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => system_error(err),
    }
}

// ---- /configstate -------------------------------------------------------

async fn get_configstate(State(state): State<ApiState>) -> Response {
    match state.store.find_node() {
        Ok(Some(node)) => (
            StatusCode::OK,
            Json(ConfigStateView {
                state: node.config_state.to_string(),
            }),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::OK,
            Json(ConfigStateView {
                state: ConfigState::Unconfigured.to_string(),
            }),
        )
            .into_response(),
        Err(err) => system_error(err),
    }
}

async fn put_configstate(
    State(state): State<ApiState>,
    Json(body): Json<ConfigStateView>,
) -> Response {
    let Ok(requested) = body.state.parse::<ConfigState>() else {
        return user_error(
            format!(
                "supported state values are '{}' and '{}'",
                ConfigState::Configuring,
                ConfigState::Configured
            ),
            "configstate.state",
        );
    };
    if !matches!(requested, ConfigState::Configuring | ConfigState::Configured) {
        return user_error(
            format!(
                "supported state values are '{}' and '{}'",
                ConfigState::Configuring,
                ConfigState::Configured
            ),
            "configstate.state",
        );
    }

    let node = match state.store.find_node() {
        Ok(Some(node)) => node,
        Ok(None) => {
            return user_error(
                "directory registration not recorded; register the node first via POST /node",
                "node",
            )
        }
        Err(err) => return system_error(err),
    };

    if node.config_state == requested {
        // Noop transitions succeed with the current state.
        return (StatusCode::OK, Json(body)).into_response();
    }
    if !node.config_state.valid_change(requested) {
        return user_error(
            format!(
                "transition from '{}' to '{requested}' is not supported",
                node.config_state
            ),
            "configstate.state",
        );
    }

    let mut node = node;
    node.config_state = requested;
    if let Err(err) = state.store.save_node(&node) {
        return system_error(err);
    }
    state.bus.publish(Event::NodeConfigured {
        org: node.org.clone(),
        id: node.id.clone(),
    });
    info!("node configuration complete");
    (StatusCode::CREATED, Json(body)).into_response()
}

// ---- /attribute ---------------------------------------------------------

async fn list_attributes(State(state): State<ApiState>) -> Response {
    match state.store.attributes() {
        Ok(attributes) => (StatusCode::OK, Json(attributes)).into_response(),
        Err(err) => system_error(err),
    }
}

async fn post_attribute(State(state): State<ApiState>, Json(attribute): Json<Attribute>) -> Response {
    if attribute.id.is_empty() {
        return user_error("attribute id must not be empty", "attribute.id");
    }
    match state.store.save_attribute(&attribute) {
        Ok(()) => (StatusCode::CREATED, Json(attribute)).into_response(),
        Err(err) => system_error(err),
    }
}

async fn delete_attribute(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.delete_attribute(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(accord_core::persistence::StoreError::NotFound { .. }) => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => system_error(err),
    }
}

// ---- /eventlog ----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventLogQuery {
    #[serde(default)]
    since: u64,
    #[serde(default = "default_limit")]
    limit: u32,
}

const fn default_limit() -> u32 {
    100
}

#[derive(Debug, Serialize)]
struct EventLogView {
    records: Vec<EventLogRecord>,
}

async fn get_eventlog(
    State(state): State<ApiState>,
    Query(query): Query<EventLogQuery>,
) -> Response {
    match state.store.event_log(query.since, query.limit) {
        Ok(records) => (StatusCode::OK, Json(EventLogView { records })).into_response(),
        Err(err) => system_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_core::events::EventKind;
    use std::time::Duration;

    fn test_state() -> (ApiState, crate::runtime::EventQueue) {
        let bus = MessageBus::new();
        let queue = bus.subscribe(
            "observer",
            &[
                EventKind::NodeRegistered,
                EventKind::NodeConfigured,
                EventKind::NodeUnconfiguring,
            ],
        );
        (
            ApiState {
                store: Arc::new(Store::open_in_memory().unwrap()),
                bus,
            },
            queue,
        )
    }

    fn registered(state: &ApiState) {
        state
            .store
            .save_node(&NodeRecord {
                org: "myorg".into(),
                id: "node1".into(),
                name: String::new(),
                token: "secret".into(),
                pattern: None,
                config_state: ConfigState::Configuring,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_configstate_happy_transition() {
        let (state, queue) = test_state();
        registered(&state);
        let response = put_configstate(
            State(state),
            Json(ConfigStateView {
                state: "configured".into(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let event = queue.pop(Duration::from_millis(50)).unwrap();
        assert!(matches!(&*event, Event::NodeConfigured { .. }));
    }

    #[tokio::test]
    async fn test_configstate_noop_is_ok() {
        let (state, queue) = test_state();
        registered(&state);
        let response = put_configstate(
            State(state),
            Json(ConfigStateView {
                state: "configuring".into(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(queue.pop(Duration::from_millis(20)).is_none());
    }

    #[tokio::test]
    async fn test_configstate_backwards_is_rejected() {
        let (state, _queue) = test_state();
        registered(&state);
        // Move forward first.
        put_configstate(
            State(state.clone()),
            Json(ConfigStateView {
                state: "configured".into(),
            }),
        )
        .await;
        let response = put_configstate(
            State(state),
            Json(ConfigStateView {
                state: "configuring".into(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_configstate_rejects_unknown_state() {
        let (state, _queue) = test_state();
        registered(&state);
        let response = put_configstate(
            State(state),
            Json(ConfigStateView {
                state: "unconfiguring".into(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_post_node_then_get() {
        let (state, queue) = test_state();
        let response = post_node(
            State(state.clone()),
            Json(NodeRegistration {
                org: "myorg".into(),
                id: "node1".into(),
                name: "edge".into(),
                token: "secret".into(),
                pattern: Some("myorg/edge".into()),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let event = queue.pop(Duration::from_millis(50)).unwrap();
        assert!(matches!(&*event, Event::NodeRegistered { .. }));

        let response = get_node(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_post_node_missing_org_is_user_error() {
        let (state, _queue) = test_state();
        let response = post_node(
            State(state),
            Json(NodeRegistration {
                org: String::new(),
                id: "node1".into(),
                name: String::new(),
                token: String::new(),
                pattern: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
