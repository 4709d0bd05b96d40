//! voldrive server binary.
//!
//! Serves named volumes over HTTP: a resumable upload protocol for writing
//! files, directory listings, capacity info and token authentication. The
//! main entry point builds the Axum router, configures optional TLS and
//! serves until a termination signal arrives.

mod auth;
mod background;
mod config;
mod error;
mod http;
mod info;
mod listing;
mod logging;
mod tls;
mod upload;
mod version;
mod volumes;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, options, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, info_span, warn};
use uuid::Uuid;

use crate::auth::{AuthSettings, AuthState, UserError};
use crate::background::spawn_background_tasks;
use crate::config::{Args, SHUTDOWN_GRACE_SECS};
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::upload::{UploadConfig, UploadService};
use crate::volumes::VolumeRegistry;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    let volumes = Arc::new(VolumeRegistry::new(
        args.volumes.clone(),
        args.mount_fs_types.clone(),
    ));
    let known = volumes.list().await;
    if known.is_empty() {
        warn!("no volumes configured or discovered");
    }
    for (label, root) in &known {
        info!(volume = label, root = ?root, "volume");
    }

    let uploads = Arc::new(UploadService::new(UploadConfig {
        session_ttl: Duration::from_secs(args.upload_session_ttl_secs),
        max_chunk_size: args.upload_max_chunk_size,
        max_upload_size: args.upload_max_size,
        io_timeout: Duration::from_secs(args.upload_io_timeout_secs),
        lock_timeout: Duration::from_secs(args.upload_lock_timeout_secs),
        public_url: args.public_url.clone(),
    }));
    let auth = Arc::new(
        AuthState::connect(auth_settings(&args), &args.database_url)
            .await
            .map_err(|err| std::io::Error::other(format!("failed to open database: {err}")))?,
    );
    info!(database = args.database_url, "auth database ready");
    match (&args.auth_pass, auth.is_disabled()) {
        (_, true) => warn!("authentication disabled"),
        (Some(password), false) => match auth.add_user(&args.auth_user, password).await {
            Ok(id) => info!(user = args.auth_user, id, "initial user created"),
            Err(UserError::Exists) => debug!(user = args.auth_user, "initial user already exists"),
            Err(err) => {
                return Err(std::io::Error::other(format!(
                    "failed to seed user: {err:?}"
                )));
            }
        },
        (None, false) => debug!("no initial user configured"),
    }

    let app = build_router(
        volumes,
        uploads.clone(),
        auth.clone(),
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let tls_config = tls::build_rustls_config(&args, host).await?;
    let handle = Handle::new();

    spawn_background_tasks(
        auth,
        uploads.clone(),
        Duration::from_secs(args.upload_reap_interval_secs),
    );
    tokio::spawn(shutdown_signal(handle.clone()));

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    match tls_config {
        Some(tls_config) => {
            info!("Starting HTTPS server at {}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(make_service)
                .await?;
        }
        None => {
            info!("Starting HTTP server at {}", addr);
            axum_server::bind(addr)
                .handle(handle)
                .serve(make_service)
                .await?;
        }
    }

    uploads.shutdown().await;
    info!("server stopped");
    Ok(())
}

/// Empty secrets are replaced with random ones; tokens then do not survive
/// a restart.
fn auth_settings(args: &Args) -> AuthSettings {
    let secret_or_random = |secret: &str, name: &str| {
        if secret.is_empty() {
            if !args.auth_disabled {
                warn!(secret = name, "secret not configured; using a random one");
            }
            Uuid::new_v4().simple().to_string()
        } else {
            secret.to_string()
        }
    };
    AuthSettings {
        disabled: args.auth_disabled,
        access_secret: secret_or_random(&args.access_secret, "access"),
        refresh_secret: secret_or_random(&args.refresh_secret, "refresh"),
        access_ttl: Duration::from_secs(args.access_ttl_secs),
        refresh_ttl: Duration::from_secs(args.refresh_ttl_secs),
        bcrypt_cost: args.bcrypt_cost,
    }
}

fn build_router(
    volumes: Arc<VolumeRegistry>,
    uploads: Arc<UploadService>,
    auth: Arc<AuthState>,
    cors_origins: Option<&str>,
) -> Router {
    let mut app = Router::new()
        .route("/info", get(info::get_info))
        .route("/filesystem/{volume}", get(listing::list_folder))
        .route("/upload", options(upload::upload_options))
        // POST takes a volume name; the other methods take an upload id.
        .route(
            "/upload/{key}",
            post(upload::create_upload)
                .head(upload::probe_upload)
                .patch(upload::append_upload)
                .delete(upload::terminate_upload)
                .options(upload::upload_options)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/users", post(auth::create_user))
        .route("/version", get(version::get_version_info))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(volumes))
        .layer(Extension(uploads))
        .layer(Extension(auth));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
