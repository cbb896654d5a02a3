use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use warp::Filter;

use lan_rooms::config::Config;
use lan_rooms::error::StartupError;
use lan_rooms::files::DiskBlobStore;
use lan_rooms::hub::Hub;
use lan_rooms::registry::RoomRegistry;
use lan_rooms::routes::{file_routes, FileContext};
use lan_rooms::server::Server;
use lan_rooms::tls;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match run(Config::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    let upload_error = |source| StartupError::UploadDir {
        path: config.upload_dir.clone(),
        source,
    };
    let blobs = Arc::new(DiskBlobStore::new(&config.upload_dir).await.map_err(upload_error)?);
    blobs.purge().await.map_err(upload_error)?;

    let registry = Arc::new(RoomRegistry::new(
        blobs.clone(),
        config.room_defaults(),
        config.max_upload_bytes(),
    ));
    let server = Arc::new(Server::new(registry, Arc::new(Hub::new()), config.authorization_policy()));
    if let Some(ttl) = config.idle_room_ttl() {
        info!("Rooms idle for {:?} will be deleted", ttl);
        server.spawn_idle_sweeper(ttl);
    }

    let ws_server = Arc::clone(&server);
    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(warp::addr::remote())
        .and(warp::header::optional::<String>("user-agent"))
        .map(move |ws: warp::ws::Ws, remote: Option<SocketAddr>, user_agent: Option<String>| {
            let server = Arc::clone(&ws_server);
            ws.on_upgrade(move |socket| server.handle_connection(socket, remote, user_agent))
        });

    let files = file_routes(Arc::new(FileContext::new(
        Arc::clone(&server),
        blobs,
        config.max_upload_bytes(),
    )));

    if !config.static_dir.is_dir() {
        warn!("Static directory {} does not exist", config.static_dir.display());
    }
    let static_files = warp::fs::dir(config.static_dir.clone());

    let routes = ws_route
        .or(files)
        .or(static_files)
        .with(warp::cors().allow_any_origin())
        .with(warp::log("lan_rooms::http"));

    let addr = config.bind_addr();
    match tls_material(&config).await {
        Some((cert, key)) => {
            let (bound, serving) = warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .bind_with_graceful_shutdown(addr, shutdown_signal());
            info!("Serving HTTPS/WSS on {}", bound);
            serving.await;
        }
        None => {
            let (bound, serving) = warp::serve(routes)
                .try_bind_with_graceful_shutdown(addr, shutdown_signal())
                .map_err(|source| StartupError::Bind { addr, source })?;
            info!("Serving HTTP/WS on {}", bound);
            serving.await;
        }
    }

    info!("Server stopped");
    Ok(())
}

/// TLS paths to serve with, or `None` for plain HTTP. Unusable material
/// downgrades to plain HTTP instead of refusing to start.
async fn tls_material(config: &Config) -> Option<(PathBuf, PathBuf)> {
    let (cert, key) = config.tls_paths()?;
    match tls::check_tls_material(cert, key).await {
        Ok(count) => {
            info!("Loaded {} certificate(s) from {}", count, cert.display());
            Some((cert.clone(), key.clone()))
        }
        Err(e) => {
            warn!("TLS disabled, falling back to plain HTTP: {}", e);
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
