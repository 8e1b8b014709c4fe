//! Common test utilities for integration tests.
//!
//! The app is wired to the in-memory store and mock backends, so these tests
//! need neither PostgreSQL nor a running media server. The PostgreSQL store
//! tests use [`create_test_pool`] instead.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Method, Request},
    Router,
};
use fake::faker::internet::en::{SafeEmail, Username};
use fake::Fake;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use domain::models::{Invitation, MediaServer, ServerType};
use domain::services::{BackendRegistry, InMemoryStore, MockBackend, MockConnector};
use invitation_api::app::{create_app, AppState};
use invitation_api::config::Config;

/// Router plus handles on its store and mock backends.
pub struct TestApp {
    pub app: Router,
    pub store: Arc<InMemoryStore>,
    pub connector: Arc<MockConnector>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_overrides(&[])
    }

    /// Build the app with configuration overrides such as
    /// `("security.rate_limit_per_minute", "2")`.
    pub fn with_overrides(overrides: &[(&str, &str)]) -> Self {
        let config = Config::load_for_test(overrides).expect("test config");
        let store = Arc::new(InMemoryStore::new());
        let connector = Arc::new(MockConnector::new());
        let registry = ServerType::ALL
            .into_iter()
            .fold(BackendRegistry::new(), |r, t| r.with(t, connector.clone()));

        let state = AppState::new(config, store.clone(), registry);
        Self {
            app: create_app(state),
            store,
            connector,
        }
    }

    pub async fn add_server(&self, name: &str, server_type: ServerType, backend: MockBackend) -> MediaServer {
        let server = self
            .store
            .add_server(MediaServer::new(name, server_type, "http://media.test"))
            .await;
        self.connector.insert(server.id, backend);
        server
    }

    pub async fn add_invitation(&self, invitation: Invitation, servers: &[&MediaServer]) -> Invitation {
        let ids: Vec<Uuid> = servers.iter().map(|s| s.id).collect();
        self.store.add_invitation(invitation, &ids).await
    }
}

/// Connect to `TEST_DATABASE_URL` and apply migrations.
///
/// Returns `None` when the variable is unset so the database tests are
/// skipped on machines without PostgreSQL.
pub async fn create_test_pool(max_connections: u32) -> Option<PgPool> {
    let database_url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("TEST_DATABASE_URL not set, skipping PostgreSQL test");
            return None;
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    persistence::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    Some(pool)
}

/// Random credentials that pass form validation.
pub struct TestUser {
    pub username: String,
    pub password: String,
    pub email: String,
}

impl TestUser {
    pub fn new() -> Self {
        let raw: String = Username().fake();
        let username: String = raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        Self {
            username: format!("u{}", username),
            password: "correct-horse-battery".to_string(),
            email: SafeEmail().fake(),
        }
    }

    pub fn form(&self) -> serde_json::Value {
        serde_json::json!({
            "username": self.username,
            "password": self.password,
            "confirm_password": self.password,
            "email": self.email,
        })
    }
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn redeem_uri(code: &str) -> String {
    format!("/api/v1/invitations/{}/redeem", code)
}

pub async fn parse_response_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
}
