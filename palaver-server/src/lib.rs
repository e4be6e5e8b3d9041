pub mod error;
pub mod friends;
pub mod messages;
pub mod notifications;
pub mod presence;

use crate::error::{ApiError, Result};
use crate::presence::ConnectionRegistry;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, RequestPartsExt, Router};
use palaver_common::non_api_structs::UserRecord;
use palaver_common::{User, UserId};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct State {
    db: sled::Db,
    registry: Arc<ConnectionRegistry>,
}

pub(crate) fn user_key(id: &UserId) -> String {
    format!("user/{}", id.0)
}

impl State {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
            registry: Arc::new(ConnectionRegistry::default()),
        })
    }

    pub fn user(&self, id: &UserId) -> Result<UserRecord> {
        let bytes = self
            .db
            .get(user_key(id))?
            .ok_or(ApiError::NotFound("user"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn put_user(&self, record: &UserRecord) -> Result<()> {
        self.db
            .insert(user_key(&record.id), serde_json::to_vec(record)?)?;
        Ok(())
    }
}

/// The caller's identity, resolved from the `x-user-id` header. Stands in
/// for a real session layer; authentication mechanics are out of scope.
pub struct AuthUser(pub UserRecord);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let Extension(state) = parts
            .extract::<Extension<State>>()
            .await
            .map_err(|err| err.into_response())?;
        let id = parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .map(|value| UserId(value.to_string()))
            .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing x-user-id header").into_response())?;
        match state.user(&id) {
            Ok(record) => Ok(AuthUser(record)),
            Err(ApiError::NotFound(_)) => {
                Err((StatusCode::UNAUTHORIZED, "unknown user").into_response())
            }
            Err(err) => Err(err.into_response()),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUser {
    pub display_name: String,
    pub password: String,
}

async fn add_user(
    Extension(state): Extension<State>,
    Json(body): Json<AddUser>,
) -> Result<(StatusCode, Json<User>)> {
    let record = UserRecord {
        id: UserId(Uuid::new_v4().to_string()),
        display_name: body.display_name,
        password: body.password,
        friends: Vec::new(),
    };
    state.put_user(&record)?;
    info!(user = %record.id, "user registered");
    Ok((StatusCode::CREATED, Json(record.public())))
}

pub fn router(state: State) -> Router {
    Router::new()
        .route("/add-user", post(add_user))
        .route("/friend/search/:name", get(friends::search))
        .route("/friend/send-request/:id", post(friends::send_request))
        .route("/friend/accept-request/:id", put(friends::accept_request))
        .route("/friend/reject-request/:id", put(friends::reject_request))
        .route("/friend/requests", get(friends::pending_requests))
        .route("/friend/list", get(friends::friend_list))
        .route("/notifications", get(notifications::list))
        .route("/messages/send/:id", post(messages::send))
        .route("/messages/:id", get(messages::history))
        .route("/ws", get(presence::ws_handler))
        .layer(Extension(state))
}
