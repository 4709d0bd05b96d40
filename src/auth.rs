//! Token authentication: users, JWT issue and verification, and the gate
//! middleware.
//!
//! Access and refresh tokens are HS256 JWTs signed with separate secrets.
//! Users and every issued token id live in SQLite, so accounts and sessions
//! survive a restart and logout or refresh rotation can revoke tokens before
//! their `exp`.

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::authorization::{Basic, Bearer};
use axum_extra::headers::{Authorization, HeaderMapExt};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS access_tokens (
    access_uuid TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    expires INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS refresh_tokens (
    refresh_uuid TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    expires INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_tokens_expires ON access_tokens(expires);
CREATE INDEX IF NOT EXISTS idx_refresh_tokens_expires ON refresh_tokens(expires);
"#;

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub disabled: bool,
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub bcrypt_cost: u32,
}

#[derive(Debug)]
pub enum UserError {
    Exists,
    Invalid,
    Hash(String),
    Database(sqlx::Error),
}

impl From<sqlx::Error> for UserError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => UserError::Exists,
            _ => UserError::Database(err),
        }
    }
}

/// Token settings plus the user and token store.
#[derive(Debug)]
pub struct AuthState {
    settings: AuthSettings,
    pool: SqlitePool,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    authorized: bool,
    access_uuid: String,
    user_id: i64,
    exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RefreshClaims {
    refresh_uuid: String,
    user_id: i64,
    exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Deserialize)]
struct CreateUserRequest {
    user_name: String,
    password: String,
}

impl AuthState {
    /// Opens (creating if needed) the database at `database_url` and
    /// initializes the schema.
    pub async fn connect(settings: AuthSettings, database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(settings, pool).await
    }

    pub async fn with_pool(settings: AuthSettings, pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { settings, pool })
    }

    pub fn is_disabled(&self) -> bool {
        self.settings.disabled
    }

    /// Adds a user with a bcrypt hash of `password`.
    pub async fn add_user(&self, user_name: &str, password: &str) -> Result<i64, UserError> {
        if user_name.trim().is_empty() || password.is_empty() {
            return Err(UserError::Invalid);
        }
        let existing = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE username = ?")
            .bind(user_name)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(UserError::Exists);
        }

        let cost = self.settings.bcrypt_cost;
        let password = password.to_string();
        let password_hash = task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|err| UserError::Hash(err.to_string()))?
            .map_err(|err| UserError::Hash(err.to_string()))?;

        let result = sqlx::query("INSERT INTO users (username, password) VALUES (?, ?)")
            .bind(user_name)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Returns the user id when the credentials match.
    async fn verify_user(&self, user_name: &str, password: &str) -> Result<Option<i64>, ApiError> {
        let row = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, password FROM users WHERE username = ?",
        )
        .bind(user_name)
        .fetch_optional(&self.pool)
        .await?;
        let Some((id, password_hash)) = row else {
            return Ok(None);
        };
        let password = password.to_string();
        let matches = task::spawn_blocking(move || bcrypt::verify(password, &password_hash))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        Ok(matches.then_some(id))
    }

    async fn issue_tokens(&self, user_id: i64) -> Result<TokenPair, ApiError> {
        let now = unix_now();
        let access = AccessClaims {
            authorized: true,
            access_uuid: Uuid::new_v4().to_string(),
            user_id,
            exp: now.saturating_add(ttl_secs(self.settings.access_ttl)),
        };
        let refresh = RefreshClaims {
            refresh_uuid: Uuid::new_v4().to_string(),
            user_id,
            exp: now.saturating_add(ttl_secs(self.settings.refresh_ttl)),
        };
        let access_token = sign(&access, &self.settings.access_secret)?;
        let refresh_token = sign(&refresh, &self.settings.refresh_secret)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO access_tokens (user_id, access_uuid, expires) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(&access.access_uuid)
            .bind(access.exp)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO refresh_tokens (user_id, refresh_uuid, expires) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(&refresh.refresh_uuid)
        .bind(refresh.exp)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    /// Verifies signature and expiry and that the token was not revoked.
    async fn verify_access(&self, token: &str) -> Result<Option<AccessClaims>, ApiError> {
        let Some(claims) = verify::<AccessClaims>(token, &self.settings.access_secret) else {
            return Ok(None);
        };
        if !claims.authorized {
            return Ok(None);
        }
        let owner =
            sqlx::query_scalar::<_, i64>("SELECT user_id FROM access_tokens WHERE access_uuid = ?")
                .bind(&claims.access_uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok((owner == Some(claims.user_id)).then_some(claims))
    }

    async fn revoke_access(&self, access_uuid: &str) -> Result<bool, ApiError> {
        let result = sqlx::query("DELETE FROM access_tokens WHERE access_uuid = ?")
            .bind(access_uuid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Consumes a refresh token. Returns its user id when it was live.
    async fn take_refresh(&self, token: &str) -> Result<Option<i64>, ApiError> {
        let Some(claims) = verify::<RefreshClaims>(token, &self.settings.refresh_secret) else {
            return Ok(None);
        };
        let result =
            sqlx::query("DELETE FROM refresh_tokens WHERE refresh_uuid = ? AND user_id = ?")
                .bind(&claims.refresh_uuid)
                .bind(claims.user_id)
                .execute(&self.pool)
                .await?;
        Ok((result.rows_affected() > 0).then_some(claims.user_id))
    }
}

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

fn sign<T: Serialize>(claims: &T, secret: &str) -> Result<String, ApiError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| ApiError::Internal(err.to_string()))
}

fn verify<T: DeserializeOwned>(token: &str, secret: &str) -> Option<T> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    match decode::<T>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
        Ok(data) => Some(data.claims),
        Err(err) => {
            debug!(error = %err, "token rejected");
            None
        }
    }
}

fn unauthorized() -> ApiError {
    let mut headers = HeaderMap::new();
    headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    ApiError::Unauthorized(headers)
}

fn is_auth_exempt(method: &Method, path: &str) -> bool {
    method == Method::OPTIONS || path == "/login" || path == "/refresh"
}

/// Requires a live bearer access token on every non-exempt request.
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthState>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if auth.is_disabled() || is_auth_exempt(req.method(), req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let authorized = match req.headers().typed_get::<Authorization<Bearer>>() {
        Some(Authorization(bearer)) => auth.verify_access(bearer.token()).await?.is_some(),
        None => false,
    };
    if !authorized {
        return Err(unauthorized());
    }
    Ok(next.run(req).await)
}

/// Exchanges Basic credentials for a token pair.
pub async fn login(
    Extension(auth): Extension<Arc<AuthState>>,
    credentials: Option<TypedHeader<Authorization<Basic>>>,
) -> Result<JsonResponse<TokenPair>, ApiError> {
    let TypedHeader(Authorization(basic)) =
        credentials.ok_or_else(|| ApiError::BadRequest("basic credentials required".into()))?;
    let Some(user_id) = auth.verify_user(basic.username(), basic.password()).await? else {
        warn!(user = basic.username(), "login failed");
        return Err(unauthorized());
    };
    let tokens = auth.issue_tokens(user_id).await?;
    info!(user = basic.username(), "login");
    Ok(JsonResponse(tokens))
}

/// Rotates a refresh token into a new token pair.
pub async fn refresh(
    Extension(auth): Extension<Arc<AuthState>>,
    body: Bytes,
) -> Result<JsonResponse<TokenPair>, ApiError> {
    let request: RefreshRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("refresh_token required".into()))?;
    let user_id = auth
        .take_refresh(&request.refresh_token)
        .await?
        .ok_or_else(unauthorized)?;
    Ok(JsonResponse(auth.issue_tokens(user_id).await?))
}

/// Revokes the presented access token.
pub async fn logout(
    Extension(auth): Extension<Arc<AuthState>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<StatusCode, ApiError> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or_else(unauthorized)?;
    let claims = auth
        .verify_access(bearer.token())
        .await?
        .ok_or_else(unauthorized)?;
    if !auth.revoke_access(&claims.access_uuid).await? {
        return Err(unauthorized());
    }
    info!(user_id = claims.user_id, "logout");
    Ok(StatusCode::OK)
}

pub async fn create_user(
    Extension(auth): Extension<Arc<AuthState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CreateUserRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("user_name and password required".into()))?;
    match auth.add_user(&request.user_name, &request.password).await {
        Ok(id) => {
            info!(user = request.user_name, id, "user created");
            Ok(StatusCode::CREATED.into_response())
        }
        Err(UserError::Exists) => Err(ApiError::Conflict("user already exists".into())),
        Err(UserError::Invalid) => Err(ApiError::BadRequest(
            "user_name and password must not be empty".into(),
        )),
        Err(UserError::Hash(msg)) => Err(ApiError::Internal(msg)),
        Err(UserError::Database(err)) => Err(err.into()),
    }
}

/// Deletes records of tokens past their expiry. Returns how many went.
pub async fn prune_expired_tokens(auth: &AuthState) -> Result<u64, sqlx::Error> {
    let now = unix_now();
    let access = sqlx::query("DELETE FROM access_tokens WHERE expires < ?")
        .bind(now)
        .execute(&auth.pool)
        .await?;
    let refresh = sqlx::query("DELETE FROM refresh_tokens WHERE expires < ?")
        .bind(now)
        .execute(&auth.pool)
        .await?;
    Ok(access.rows_affected() + refresh.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use tower::ServiceExt;

    fn settings() -> AuthSettings {
        AuthSettings {
            disabled: false,
            access_secret: "access-secret".into(),
            refresh_secret: "refresh-secret".into(),
            access_ttl: Duration::from_secs(900),
            refresh_ttl: Duration::from_secs(3600),
            bcrypt_cost: 4,
        }
    }

    /// One connection, so every query sees the same in-memory database.
    async fn memory_state(settings: AuthSettings) -> Arc<AuthState> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("memory pool");
        Arc::new(AuthState::with_pool(settings, pool).await.expect("schema"))
    }

    async fn state_with_user() -> Arc<AuthState> {
        let state = memory_state(settings()).await;
        state.add_user("admin", "hunter2").await.expect("seed user");
        state
    }

    async fn is_live(state: &AuthState, token: &str) -> bool {
        state.verify_access(token).await.expect("verify").is_some()
    }

    fn basic(user: &str, pass: &str) -> Option<TypedHeader<Authorization<Basic>>> {
        Some(TypedHeader(Authorization::basic(user, pass)))
    }

    fn bearer(token: &str) -> Option<TypedHeader<Authorization<Bearer>>> {
        Some(TypedHeader(Authorization::bearer(token).expect("bearer")))
    }

    async fn login_pair(state: &Arc<AuthState>) -> TokenPair {
        let JsonResponse(pair) = login(Extension(state.clone()), basic("admin", "hunter2"))
            .await
            .expect("login");
        pair
    }

    fn gated_app(state: Arc<AuthState>) -> Router {
        Router::new()
            .route("/info", get(|| async { "ok" }))
            .route("/login", get(|| async { "login" }))
            .layer(middleware::from_fn(auth_middleware))
            .layer(Extension(state))
    }

    async fn status_of(app: Router, method: Method, path: &str, token: Option<&str>) -> StatusCode {
        let mut request = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        app.oneshot(request.body(AxumBody::empty()).expect("request"))
            .await
            .expect("response")
            .status()
    }

    #[tokio::test]
    async fn login_checks_credentials() {
        let state = state_with_user().await;
        assert!(matches!(
            login(Extension(state.clone()), None).await,
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            login(Extension(state.clone()), basic("admin", "wrong")).await,
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            login(Extension(state.clone()), basic("nobody", "hunter2")).await,
            Err(ApiError::Unauthorized(_))
        ));
        let pair = login_pair(&state).await;
        assert!(is_live(&state, &pair.access_token).await);
        assert!(!is_live(&state, &pair.refresh_token).await);
    }

    #[tokio::test]
    async fn middleware_requires_live_access_token() {
        let state = state_with_user().await;
        let pair = login_pair(&state).await;

        let app = gated_app(state.clone());
        assert_eq!(
            status_of(app.clone(), Method::GET, "/info", None).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(app.clone(), Method::GET, "/info", Some("garbage")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(app.clone(), Method::GET, "/info", Some(&pair.access_token)).await,
            StatusCode::OK
        );
        assert_eq!(
            status_of(app.clone(), Method::GET, "/login", None).await,
            StatusCode::OK
        );

        let status = logout(Extension(state.clone()), bearer(&pair.access_token))
            .await
            .expect("logout");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            status_of(app, Method::GET, "/info", Some(&pair.access_token)).await,
            StatusCode::UNAUTHORIZED
        );
        assert!(matches!(
            logout(Extension(state), bearer(&pair.access_token)).await,
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn disabled_gate_and_preflight_pass_through() {
        let state = memory_state(AuthSettings {
            disabled: true,
            ..settings()
        })
        .await;
        assert_eq!(
            status_of(gated_app(state), Method::GET, "/info", None).await,
            StatusCode::OK
        );

        let app = gated_app(state_with_user().await);
        let status = status_of(app, Method::OPTIONS, "/info", None).await;
        assert_ne!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn expired_access_token_is_rejected() {
        let state = state_with_user().await;
        let claims = AccessClaims {
            authorized: true,
            access_uuid: Uuid::new_v4().to_string(),
            user_id: 1,
            exp: unix_now() - 10,
        };
        sqlx::query("INSERT INTO access_tokens (user_id, access_uuid, expires) VALUES (?, ?, ?)")
            .bind(claims.user_id)
            .bind(&claims.access_uuid)
            .bind(claims.exp)
            .execute(&state.pool)
            .await
            .expect("insert token");
        let token = sign(&claims, "access-secret").expect("sign");
        assert!(!is_live(&state, &token).await);

        let live = login_pair(&state).await;
        assert_eq!(prune_expired_tokens(&state).await.expect("prune"), 1);
        assert!(is_live(&state, &live.access_token).await);
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM access_tokens")
            .fetch_one(&state.pool)
            .await
            .expect("count");
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn users_and_sessions_survive_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", temp.path().join("auth.db").display());

        let state = Arc::new(AuthState::connect(settings(), &url).await.expect("open"));
        state.add_user("admin", "hunter2").await.expect("seed user");
        let pair = login_pair(&state).await;
        state.pool.close().await;
        drop(state);

        let state = Arc::new(AuthState::connect(settings(), &url).await.expect("reopen"));
        assert!(is_live(&state, &pair.access_token).await);
        assert!(matches!(
            state.add_user("admin", "other").await,
            Err(UserError::Exists)
        ));
        login_pair(&state).await;

        let body = Bytes::from(format!(r#"{{"refresh_token":"{}"}}"#, pair.refresh_token));
        refresh(Extension(state), body).await.expect("refresh after reopen");
    }

    #[tokio::test]
    async fn refresh_rotates_tokens() {
        let state = state_with_user().await;
        let pair = login_pair(&state).await;

        let body = Bytes::from(format!(r#"{{"refresh_token":"{}"}}"#, pair.refresh_token));
        let JsonResponse(rotated) = refresh(Extension(state.clone()), body.clone())
            .await
            .expect("refresh");
        assert!(is_live(&state, &rotated.access_token).await);

        assert!(matches!(
            refresh(Extension(state.clone()), body).await,
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            refresh(Extension(state.clone()), Bytes::from_static(b"{}")).await,
            Err(ApiError::BadRequest(_))
        ));
        let forged = Bytes::from(format!(r#"{{"refresh_token":"{}"}}"#, pair.access_token));
        assert!(matches!(
            refresh(Extension(state), forged).await,
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn creates_users() {
        let state = state_with_user().await;
        let body = Bytes::from_static(br#"{"user_name":"alice","password":"s3cret"}"#);
        let response = create_user(Extension(state.clone()), body.clone())
            .await
            .expect("create");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(matches!(
            create_user(Extension(state.clone()), body).await,
            Err(ApiError::Conflict(_))
        ));
        assert!(matches!(
            create_user(
                Extension(state.clone()),
                Bytes::from_static(br#"{"user_name":"","password":"x"}"#)
            )
            .await,
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            create_user(Extension(state.clone()), Bytes::from_static(b"not json")).await,
            Err(ApiError::BadRequest(_))
        ));

        let JsonResponse(pair) = login(Extension(state.clone()), basic("alice", "s3cret"))
            .await
            .expect("login as new user");
        assert!(is_live(&state, &pair.access_token).await);
    }
}
