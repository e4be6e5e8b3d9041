use crate::error::{ApiError, Result};
use crate::notifications::{self, RequestEvent};
use crate::{user_key, AuthUser, State};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use palaver_common::non_api_structs::UserRecord;
use palaver_common::{FriendRequest, RequestId, RequestStatus, User, UserId};
use serde_json::{json, Value};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use tracing::info;
use uuid::Uuid;

fn request_key(id: &RequestId) -> String {
    format!("request/{}", id.0)
}

// Index claiming the ordered (sender, receiver) pair while a request is
// pending. Present iff an unresolved request exists in that direction.
fn pending_key(sender: &UserId, receiver: &UserId) -> String {
    format!("pending/{}/{}", sender.0, receiver.0)
}

pub fn search_users(state: &State, query: &str, exclude: &UserId) -> Result<Vec<User>> {
    let needle = query.to_lowercase();
    let mut matches = Vec::new();
    for entry in state.db.scan_prefix("user/") {
        let (_, value) = entry?;
        let record: UserRecord = serde_json::from_slice(&value)?;
        if record.id != *exclude && record.display_name.to_lowercase().contains(&needle) {
            matches.push(record.public());
        }
    }
    Ok(matches)
}

/// Creates a pending request. The pending-index claim is a single
/// compare-and-swap, so two racing sends for the same ordered pair cannot
/// both succeed. The reverse direction is deliberately not checked.
pub fn create(state: &State, sender: &UserRecord, receiver_id: &UserId) -> Result<FriendRequest> {
    state.user(receiver_id)?;
    let request = FriendRequest {
        id: RequestId(Uuid::new_v4().to_string()),
        sender_id: sender.id.clone(),
        receiver_id: receiver_id.clone(),
        status: RequestStatus::Pending,
        created_at: Utc::now(),
    };
    let claim = state.db.compare_and_swap(
        pending_key(&sender.id, receiver_id).as_bytes(),
        None as Option<&[u8]>,
        Some(request.id.0.as_bytes()),
    )?;
    if claim.is_err() {
        return Err(ApiError::DuplicateRequest);
    }
    state
        .db
        .insert(request_key(&request.id), serde_json::to_vec(&request)?)?;
    Ok(request)
}

fn load_request(state: &State, id: &RequestId) -> Result<Option<FriendRequest>> {
    match state.db.get(request_key(id))? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn abort(err: ApiError) -> ConflictableTransactionError<ApiError> {
    ConflictableTransactionError::Abort(err)
}

fn load_user_tx(
    tx: &TransactionalTree,
    id: &UserId,
) -> std::result::Result<UserRecord, ConflictableTransactionError<ApiError>> {
    let bytes = tx
        .get(user_key(id))?
        .ok_or_else(|| abort(ApiError::NotFound("user")))?;
    serde_json::from_slice(&bytes).map_err(|err| abort(err.into()))
}

fn unwrap_transaction<T>(result: std::result::Result<T, TransactionError<ApiError>>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(err)) => Err(err),
        Err(TransactionError::Storage(err)) => Err(ApiError::Internal(err.into())),
    }
}

/// Accepts a pending request. The status flip, both friend-list appends,
/// the pending-index removal and the stale-notification deletion commit
/// as one sled transaction; a concurrent accept/reject re-reads a
/// non-pending status and aborts with `InvalidRequest`.
pub fn accept(state: &State, id: &RequestId) -> Result<FriendRequest> {
    let request = load_request(state, id)?.ok_or(ApiError::InvalidRequest)?;
    let stale = notifications::request_notification_keys(
        state,
        &request.receiver_id,
        &request.sender_id,
    )?;
    let key = request_key(id);
    let pending = pending_key(&request.sender_id, &request.receiver_id);
    let result = state
        .db
        .transaction(|tx| -> ConflictableTransactionResult<FriendRequest, ApiError> {
            let bytes = tx
                .get(key.as_bytes())?
                .ok_or_else(|| abort(ApiError::InvalidRequest))?;
            let mut request: FriendRequest =
                serde_json::from_slice(&bytes).map_err(|err| abort(err.into()))?;
            if request.status != RequestStatus::Pending {
                return Err(abort(ApiError::InvalidRequest));
            }
            request.status = RequestStatus::Accepted;
            tx.insert(
                key.as_bytes(),
                serde_json::to_vec(&request).map_err(|err| abort(err.into()))?,
            )?;

            let mut sender = load_user_tx(tx, &request.sender_id)?;
            let mut receiver = load_user_tx(tx, &request.receiver_id)?;
            if !sender.is_friend(&request.receiver_id) {
                sender.friends.push(request.receiver_id.clone());
            }
            if !receiver.is_friend(&request.sender_id) {
                receiver.friends.push(request.sender_id.clone());
            }
            tx.insert(
                user_key(&sender.id).as_bytes(),
                serde_json::to_vec(&sender).map_err(|err| abort(err.into()))?,
            )?;
            tx.insert(
                user_key(&receiver.id).as_bytes(),
                serde_json::to_vec(&receiver).map_err(|err| abort(err.into()))?,
            )?;

            tx.remove(pending.as_bytes())?;
            for stale_key in &stale {
                tx.remove(stale_key.as_bytes())?;
            }
            Ok(request)
        });
    unwrap_transaction(result)
}

/// Rejects a pending request. Terminal like accept, but leaves both
/// friend lists untouched and keeps the durable notification path open
/// for the rejection notice.
pub fn reject(state: &State, id: &RequestId) -> Result<FriendRequest> {
    let request = load_request(state, id)?.ok_or(ApiError::InvalidRequest)?;
    let key = request_key(id);
    let pending = pending_key(&request.sender_id, &request.receiver_id);
    let result = state
        .db
        .transaction(|tx| -> ConflictableTransactionResult<FriendRequest, ApiError> {
            let bytes = tx
                .get(key.as_bytes())?
                .ok_or_else(|| abort(ApiError::InvalidRequest))?;
            let mut request: FriendRequest =
                serde_json::from_slice(&bytes).map_err(|err| abort(err.into()))?;
            if request.status != RequestStatus::Pending {
                return Err(abort(ApiError::InvalidRequest));
            }
            request.status = RequestStatus::Rejected;
            tx.insert(
                key.as_bytes(),
                serde_json::to_vec(&request).map_err(|err| abort(err.into()))?,
            )?;
            tx.remove(pending.as_bytes())?;
            Ok(request)
        });
    unwrap_transaction(result)
}

pub fn incoming_pending(state: &State, user: &UserId) -> Result<Vec<FriendRequest>> {
    let mut requests = Vec::new();
    for entry in state.db.scan_prefix("request/") {
        let (_, value) = entry?;
        let request: FriendRequest = serde_json::from_slice(&value)?;
        if request.receiver_id == *user && request.status == RequestStatus::Pending {
            requests.push(request);
        }
    }
    Ok(requests)
}

pub async fn search(
    Extension(state): Extension<State>,
    AuthUser(caller): AuthUser,
    Path(name): Path<String>,
) -> Result<Json<Vec<User>>> {
    Ok(Json(search_users(&state, &name, &caller.id)?))
}

pub async fn send_request(
    Extension(state): Extension<State>,
    AuthUser(sender): AuthUser,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<FriendRequest>)> {
    let request = create(&state, &sender, &UserId(id))?;
    info!(sender = %request.sender_id, receiver = %request.receiver_id, "friend request sent");
    notifications::notify(
        &state,
        RequestEvent::Sent,
        &request.sender_id,
        &sender.display_name,
        &request.receiver_id,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn accept_request(
    Extension(state): Extension<State>,
    AuthUser(caller): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let request = accept(&state, &RequestId(id))?;
    info!(request = %request.id, "friend request accepted");
    notifications::notify(
        &state,
        RequestEvent::Accepted,
        &request.sender_id,
        &caller.display_name,
        &request.receiver_id,
    )
    .await?;
    Ok(Json(json!({ "message": "friend request accepted" })))
}

pub async fn reject_request(
    Extension(state): Extension<State>,
    AuthUser(caller): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let request = reject(&state, &RequestId(id))?;
    info!(request = %request.id, "friend request rejected");
    notifications::notify(
        &state,
        RequestEvent::Rejected,
        &request.sender_id,
        &caller.display_name,
        &request.receiver_id,
    )
    .await?;
    Ok(Json(json!({ "message": "friend request rejected" })))
}

pub async fn pending_requests(
    Extension(state): Extension<State>,
    AuthUser(caller): AuthUser,
) -> Result<Json<Vec<FriendRequest>>> {
    Ok(Json(incoming_pending(&state, &caller.id)?))
}

pub async fn friend_list(AuthUser(caller): AuthUser) -> Result<Json<Vec<UserId>>> {
    Ok(Json(caller.friends))
}
