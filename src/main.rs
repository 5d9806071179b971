//! reefshare server binary.
//!
//! This crate wires together the HTTP API, WebDAV routing, authentication,
//! admission control, and the hot-reloadable configuration store. The main
//! entry point builds the Axum router, configures TLS when enabled, and
//! starts the listener.

mod admin;
mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod etag;
mod files;
mod http;
mod ipfilter;
mod limit;
mod locking;
mod logging;
mod metrics;
mod quota;
mod rules;
mod storage;
mod textshare;
mod tls;
mod webdav;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{any, delete, get, post, put};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::DynamicUsers;
use crate::background::spawn_background_tasks;
use crate::config::{Args, ConfigStore};
use crate::http::build_cors_layer;
use crate::limit::Limiter;
use crate::locking::LockManager;
use crate::metrics::Metrics;
use crate::quota::QuotaTracker;
use crate::webdav::DavGateway;

/// Starts the reefshare server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();

    let store = match ConfigStore::load(PathBuf::from(&args.config)) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("failed to load configuration '{}': {err}", args.config);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                err.to_string(),
            ));
        }
    };
    let config = store.snapshot();
    logging::init_logging(&config.logging);

    let metrics = Arc::new(Metrics::new());
    let limiter = Arc::new(Limiter::new(&config.rate_limit));
    let gateway = Arc::new(DavGateway::new(&config));
    let quota = Arc::new(QuotaTracker::new());
    let dynamic_users = Arc::new(DynamicUsers::new());
    let lock_manager = Arc::new(LockManager::new());

    // The DAV mount path is fixed at startup; other config changes apply on
    // hot reload without re-routing.
    let mount_path = config.dav.mount_path.clone();

    let mut app = Router::new()
        .route("/", get(http::index))
        .route("/healthz", get(metrics::healthz))
        .route("/metrics", get(metrics::metrics_endpoint))
        .route("/t/{id}", get(textshare::get_text_share))
        .route("/api/session", get(files::session))
        .route("/api/list", get(files::list_files))
        .route("/api/download", get(files::download_file))
        .route(
            "/api/upload",
            post(files::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/mkdir", post(files::make_directory))
        .route("/api/rename", post(files::rename_entry))
        .route("/api/delete", post(files::delete_entries))
        .route("/api/textshare", post(textshare::create_text_share))
        .route("/api/admin/status", get(admin::status))
        .route(
            "/api/admin/shares/{name}/quota",
            put(admin::update_share_quota),
        )
        .route(
            "/api/admin/users",
            get(admin::list_users).post(admin::create_user),
        )
        .route("/api/admin/users/{name}", delete(admin::remove_user))
        .route(&mount_path, any(webdav::webdav_handler))
        .route(
            &format!("{mount_path}/{{*path}}"),
            any(webdav::webdav_handler),
        )
        .layer(middleware::from_fn(limit::admission_middleware))
        .layer(middleware::from_fn(ipfilter::ip_filter_middleware))
        .layer(middleware::from_fn(metrics::record_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
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
        .layer(Extension(store.clone()))
        .layer(Extension(metrics.clone()))
        .layer(Extension(limiter.clone()))
        .layer(Extension(gateway.clone()))
        .layer(Extension(quota.clone()))
        .layer(Extension(dynamic_users))
        .layer(Extension(lock_manager));

    if let Some(cors_layer) = build_cors_layer(config.server.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .as_deref()
        .unwrap_or(&config.server.addr)
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let port = args.port.unwrap_or(config.server.port);
    let addr = SocketAddr::new(host, port);
    let handle = Handle::new();

    info!(
        shares = config.shares.len(),
        dav = config.dav.enabled,
        tls = config.server.tls.enabled,
        "reefshare starting"
    );

    spawn_background_tasks(store, limiter, gateway, quota);

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    if config.server.tls.enabled {
        let tls_config = tls::build_rustls_config(&config.server.tls, host).await?;
        info!("starting HTTPS server at {}", addr);
        let server = axum_server::bind_rustls(addr, tls_config)
            .handle(handle.clone())
            .serve(service);
        tokio::select! {
            result = server => result?,
            _ = shutdown_signal(handle) => {}
        }
    } else {
        info!("starting HTTP server at {}", addr);
        let server = axum_server::bind(addr).handle(handle.clone()).serve(service);
        tokio::select! {
            result = server => result?,
            _ = shutdown_signal(handle) => {}
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
