//! QuantumShield realtime relay.
//!
//! Authenticated WebSocket event bus for end-to-end encrypted ephemeral
//! messaging: verifies bearer tokens at handshake, enforces the friendship
//! ACL and per-message Falcon-1024 signatures before forwarding, and delivers
//! strictly in real time — no envelope is ever persisted. The HTTP surface
//! carries peer key lookup and the friendship state machine.

pub mod config;
pub mod directory;
pub mod error;
pub mod friends;
pub mod handlers;
pub mod jwt;
pub mod rate_limit;
pub mod state;
pub mod ws;

use std::io;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpResponse, HttpServer};
use tracing::info;

pub use config::RelayConfig;
pub use directory::{MemoryDirectory, UserDirectory, UserId, UserRecord};
pub use error::RelayError;
pub use friends::{FriendStore, MemoryFriendStore};
pub use jwt::JwtService;
pub use state::AppState;
pub use ws::{ClientEvent, RelayService, ServerEvent};

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Route table, shared by the server and by tests.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/ws", web::get().to(handlers::ws_connect))
        .route("/users/{id}/keys", web::get().to(handlers::get_user_keys))
        .route(
            "/friends/request",
            web::post().to(handlers::create_friend_request),
        )
        .route(
            "/friends/requests/pending",
            web::get().to(handlers::pending_requests),
        )
        .route(
            "/friends/request/{id}/accept",
            web::post().to(handlers::accept_friend_request),
        )
        .route(
            "/friends/request/{id}/reject",
            web::post().to(handlers::reject_friend_request),
        )
        .route("/friends/list", web::get().to(handlers::list_friends))
        .route(
            "/friends/{friend_id}",
            web::delete().to(handlers::remove_friend),
        );
}

fn build_cors(allowed: Vec<String>) -> Cors {
    Cors::default()
        .allowed_origin_fn(move |origin, _req_head| {
            origin
                .to_str()
                .map(|o| allowed.iter().any(|a| a == o))
                .unwrap_or(false)
        })
        .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
        .allowed_headers(vec!["Authorization", "Content-Type"])
        .supports_credentials()
        .max_age(3600)
}

/// The relay server: config plus the two external store boundaries.
pub struct RelayServer {
    config: RelayConfig,
    directory: Arc<dyn UserDirectory>,
    friends: Arc<dyn FriendStore>,
}

impl RelayServer {
    pub fn new(
        config: RelayConfig,
        directory: Arc<dyn UserDirectory>,
        friends: Arc<dyn FriendStore>,
    ) -> Self {
        Self {
            config,
            directory,
            friends,
        }
    }

    pub async fn start(self) -> io::Result<()> {
        info!(
            "🚀 starting QuantumShield relay on {}:{}",
            self.config.server.host, self.config.server.port
        );

        error::set_detailed_errors(self.config.auth.detailed_errors);

        let bind_addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let workers = self.config.server.workers;
        let allowed_origins = self.config.origins.allowed.clone();
        let state = web::Data::new(AppState::new(self.config, self.directory, self.friends));

        HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .wrap(build_cors(allowed_origins.clone()))
                .wrap(Logger::default())
                .configure(configure_routes)
        })
        .bind(bind_addr)?
        .workers(workers)
        .run()
        .await
    }
}

/// Initialize structured logging for the relay process.
pub fn init_observability() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::test;
    use quantumshield_core::pqc::{kem_keygen, sig_keygen};

    fn seeded_state() -> web::Data<AppState> {
        let directory = Arc::new(MemoryDirectory::new());
        for (user_id, username) in [(10, "alice"), (11, "bob")] {
            let (kem_pk, _) = kem_keygen();
            let (sig_pk, _) = sig_keygen();
            directory
                .register(UserRecord {
                    user_id,
                    username: username.to_string(),
                    kem_public_key: kem_pk,
                    sig_public_key: sig_pk,
                })
                .unwrap();
        }
        web::Data::new(AppState::new(
            RelayConfig::test_config(),
            directory,
            Arc::new(MemoryFriendStore::new()),
        ))
    }

    fn bearer(state: &AppState, user_id: UserId, username: &str) -> (String, String) {
        let token = state
            .jwt
            .issue_token(user_id, username, chrono::Duration::hours(1))
            .unwrap();
        ("Authorization".to_string(), format!("Bearer {token}"))
    }

    #[actix_web::test]
    async fn health_endpoint_responds() {
        let state = seeded_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request())
            .await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn endpoints_require_authentication() {
        let state = seeded_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/friends/list").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn full_friendship_flow_over_http() {
        let state = seeded_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;
        let alice = bearer(&state, 10, "alice");
        let bob = bearer(&state, 11, "bob");

        // Alice requests Bob
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/friends/request")
                .insert_header(alice.clone())
                .set_json(serde_json::json!({ "receiver_username": "bob" }))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: serde_json::Value = test::read_body_json(resp).await;
        let request_id = created["id"].as_u64().unwrap();

        // Bob sees it pending
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/friends/requests/pending")
                .insert_header(bob.clone())
                .to_request(),
        )
        .await;
        let pending: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(pending.as_array().unwrap().len(), 1);
        assert_eq!(pending[0]["username"], "alice");

        // Bob accepts
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri(&format!("/friends/request/{request_id}/accept"))
                .insert_header(bob.clone())
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // both sides list the friendship
        for (header, friend_name) in [(alice.clone(), "bob"), (bob.clone(), "alice")] {
            let resp = test::call_service(
                &app,
                test::TestRequest::get()
                    .uri("/friends/list")
                    .insert_header(header)
                    .to_request(),
            )
            .await;
            let friends: serde_json::Value = test::read_body_json(resp).await;
            assert_eq!(friends.as_array().unwrap().len(), 1);
            assert_eq!(friends[0]["username"], friend_name);
        }

        // accepting twice is a 400
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri(&format!("/friends/request/{request_id}/accept"))
                .insert_header(bob.clone())
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Alice removes Bob
        let resp = test::call_service(
            &app,
            test::TestRequest::delete()
                .uri("/friends/11")
                .insert_header(alice.clone())
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/friends/list")
                .insert_header(alice)
                .to_request(),
        )
        .await;
        let friends: serde_json::Value = test::read_body_json(resp).await;
        assert!(friends.as_array().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn self_and_unknown_requests_are_rejected() {
        let state = seeded_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;
        let alice = bearer(&state, 10, "alice");

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/friends/request")
                .insert_header(alice.clone())
                .set_json(serde_json::json!({ "receiver_username": "alice" }))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/friends/request")
                .insert_header(alice)
                .set_json(serde_json::json!({ "receiver_username": "mallory" }))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn friend_requests_are_rate_limited_with_retry_after() {
        let directory = Arc::new(MemoryDirectory::new());
        for user_id in 10..25u64 {
            let (kem_pk, _) = kem_keygen();
            let (sig_pk, _) = sig_keygen();
            directory
                .register(UserRecord {
                    user_id,
                    username: format!("user{user_id}"),
                    kem_public_key: kem_pk,
                    sig_public_key: sig_pk,
                })
                .unwrap();
        }
        let state = web::Data::new(AppState::new(
            RelayConfig::test_config(),
            directory,
            Arc::new(MemoryFriendStore::new()),
        ));
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;
        let alice = bearer(&state, 10, "user10");

        // the configured floor is 10 per hour
        for target in 11..21u64 {
            let resp = test::call_service(
                &app,
                test::TestRequest::post()
                    .uri("/friends/request")
                    .insert_header(alice.clone())
                    .set_json(serde_json::json!({ "receiver_username": format!("user{target}") }))
                    .to_request(),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::CREATED);
        }
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/friends/request")
                .insert_header(alice)
                .set_json(serde_json::json!({ "receiver_username": "user24" }))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key("Retry-After"));
    }

    #[actix_web::test]
    async fn peer_keys_endpoint_returns_stored_keys() {
        let state = seeded_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;
        let alice = bearer(&state, 10, "alice");

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/users/11/keys")
                .insert_header(alice.clone())
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert!(body["kem_public_key"].as_str().unwrap().len() > 1000);
        assert!(body["sig_public_key"].as_str().unwrap().len() > 1000);

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/users/404/keys")
                .insert_header(alice)
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
