//! HTTP surface: peer key lookup, the friendship endpoints, and the
//! WebSocket upgrade.
//!
//! Every endpoint requires a bearer token. The friendship endpoints drive the
//! state machine in [`crate::friends`]; successful request creation also
//! pushes a `friend_request_received` notification into the receiver's room
//! (informational only, the HTTP response is authoritative).

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::directory::{UserDirectory, UserId};
use crate::error::RelayError;
use crate::friends::FriendStore;
use crate::jwt::JwtService;
use crate::state::AppState;
use crate::ws::ConnectionMetadata;

/// Extract and authorize the bearer identity of a request.
fn bearer_user(req: &HttpRequest, jwt: &JwtService) -> Result<(UserId, String), RelayError> {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(RelayError::Authentication)?;
    let token = header_value
        .strip_prefix("Bearer ")
        .ok_or(RelayError::Authentication)?;
    let claims = jwt.validate_token(token)?;
    let user_id = claims
        .sub
        .parse()
        .map_err(|_| RelayError::Authentication)?;
    Ok((user_id, claims.username))
}

/// Origin gate: a present Origin header must be allow-listed. Requests
/// without one (non-browser clients) proceed to token validation.
fn check_origin(req: &HttpRequest, allowed: &[String]) -> Result<(), RelayError> {
    if let Some(origin) = req.headers().get(header::ORIGIN) {
        let origin = origin.to_str().map_err(|_| RelayError::OriginNotAllowed)?;
        if !allowed.iter().any(|a| a == origin) {
            return Err(RelayError::OriginNotAllowed);
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct UserKeysResponse {
    pub kem_public_key: String,
    pub sig_public_key: String,
}

/// GET /users/{id}/keys
pub async fn get_user_keys(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<UserId>,
) -> Result<HttpResponse, RelayError> {
    let (caller, _) = bearer_user(&req, &state.jwt)?;
    state.limits.http.check(caller)?;

    let user = state
        .directory
        .get_user(path.into_inner())
        .await?
        .ok_or_else(|| RelayError::NotFound("no such user".to_string()))?;
    Ok(HttpResponse::Ok().json(UserKeysResponse {
        kem_public_key: user.kem_public_key.to_base64(),
        sig_public_key: user.sig_public_key.to_base64(),
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateFriendRequestBody {
    #[validate(length(min = 1, max = 64))]
    pub receiver_username: String,
}

#[derive(Debug, Serialize)]
pub struct FriendRequestResponse {
    pub id: u64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub status: crate::friends::RequestStatus,
    pub created_at: String,
}

/// POST /friends/request
pub async fn create_friend_request(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateFriendRequestBody>,
) -> Result<HttpResponse, RelayError> {
    let (sender_id, sender_username) = bearer_user(&req, &state.jwt)?;
    body.validate()
        .map_err(|e| RelayError::BadRequest(e.to_string()))?;
    state.limits.friend_requests.check(sender_id)?;

    let receiver = state
        .directory
        .find_by_username(&body.receiver_username)
        .await?
        .ok_or_else(|| RelayError::NotFound("no such user".to_string()))?;
    let request = state
        .friends
        .create_request(sender_id, receiver.user_id)
        .await?;

    state
        .relay
        .notify_friend_request(&request, &sender_username)
        .await;

    Ok(HttpResponse::Created().json(FriendRequestResponse {
        id: request.id,
        sender_id: request.sender_id,
        receiver_id: request.receiver_id,
        status: request.status,
        created_at: request.created_at.to_rfc3339(),
    }))
}

#[derive(Debug, Serialize)]
pub struct PendingRequestEntry {
    pub id: u64,
    pub sender_id: UserId,
    pub username: String,
    pub created_at: String,
}

/// GET /friends/requests/pending
pub async fn pending_requests(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, RelayError> {
    let (caller, _) = bearer_user(&req, &state.jwt)?;
    state.limits.http.check(caller)?;

    let mut entries = Vec::new();
    for request in state.friends.pending_for(caller).await? {
        let username = state
            .directory
            .get_user(request.sender_id)
            .await?
            .map(|u| u.username)
            .unwrap_or_default();
        entries.push(PendingRequestEntry {
            id: request.id,
            sender_id: request.sender_id,
            username,
            created_at: request.created_at.to_rfc3339(),
        });
    }
    Ok(HttpResponse::Ok().json(entries))
}

#[derive(Debug, Serialize)]
pub struct RequestOutcome {
    pub id: u64,
    pub status: crate::friends::RequestStatus,
    pub responded_at: Option<String>,
}

/// POST /friends/request/{id}/accept
pub async fn accept_friend_request(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> Result<HttpResponse, RelayError> {
    let (caller, _) = bearer_user(&req, &state.jwt)?;
    state.limits.http.check(caller)?;

    let request = state.friends.accept(path.into_inner(), caller).await?;
    Ok(HttpResponse::Ok().json(RequestOutcome {
        id: request.id,
        status: request.status,
        responded_at: request.responded_at.map(|t| t.to_rfc3339()),
    }))
}

/// POST /friends/request/{id}/reject
pub async fn reject_friend_request(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> Result<HttpResponse, RelayError> {
    let (caller, _) = bearer_user(&req, &state.jwt)?;
    state.limits.http.check(caller)?;

    let request = state.friends.reject(path.into_inner(), caller).await?;
    Ok(HttpResponse::Ok().json(RequestOutcome {
        id: request.id,
        status: request.status,
        responded_at: request.responded_at.map(|t| t.to_rfc3339()),
    }))
}

#[derive(Debug, Serialize)]
pub struct FriendEntry {
    pub friend_id: UserId,
    pub username: String,
    pub created_at: String,
}

/// GET /friends/list
pub async fn list_friends(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, RelayError> {
    let (caller, _) = bearer_user(&req, &state.jwt)?;
    state.limits.http.check(caller)?;

    let mut entries = Vec::new();
    for friendship in state.friends.friends_of(caller).await? {
        let friend_id = if friendship.user_a == caller {
            friendship.user_b
        } else {
            friendship.user_a
        };
        let username = state
            .directory
            .get_user(friend_id)
            .await?
            .map(|u| u.username)
            .unwrap_or_default();
        entries.push(FriendEntry {
            friend_id,
            username,
            created_at: friendship.created_at.to_rfc3339(),
        });
    }
    Ok(HttpResponse::Ok().json(entries))
}

/// DELETE /friends/{friend_id}
pub async fn remove_friend(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<UserId>,
) -> Result<HttpResponse, RelayError> {
    let (caller, _) = bearer_user(&req, &state.jwt)?;
    state.limits.http.check(caller)?;

    state.friends.remove_friend(caller, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
    pub user_id: UserId,
}

/// GET /ws — the authenticated WebSocket handshake.
///
/// Token signature, expiry, and subject/user-id match are all enforced
/// before the protocol upgrade; no session state exists on failure.
pub async fn ws_connect(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsAuthQuery>,
) -> Result<HttpResponse, actix_web::Error> {
    check_origin(&req, &state.config.origins.allowed)?;

    let handshake_timeout =
        std::time::Duration::from_secs(state.config.auth.handshake_timeout_secs);
    let user = tokio::time::timeout(handshake_timeout, async {
        state.jwt.authorize(&query.token, query.user_id)?;
        state
            .directory
            .get_user(query.user_id)
            .await?
            .ok_or(RelayError::Authentication)
    })
    .await
    .map_err(|_| RelayError::Authentication)??;

    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    let metadata = ConnectionMetadata {
        user_id: user.user_id,
        username: user.username,
        remote_addr: req
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        connected_at: chrono::Utc::now(),
    };
    actix_web::rt::spawn(
        state
            .relay
            .clone()
            .handle_connection(session, msg_stream, metadata),
    );

    Ok(response)
}
