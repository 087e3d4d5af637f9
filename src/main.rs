use actix_cors::Cors;
use actix_web::middleware::from_fn;
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use pushcore_server::websocket::http::websocket_gate;
use pushcore_server::{health_check, AppError, AppState, Settings};
use std::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn build_cors(config: &Settings) -> Cors {
    if !config.cors.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors = if config.cors.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
    } else {
        Cors::default()
            .allowed_origin("http://localhost:8080")
            .allowed_origin("http://127.0.0.1:8080")
            .allowed_methods(vec!["GET"])
    };
    cors.max_age(config.cors.max_age as usize)
}

#[actix_web::main]
async fn main() -> pushcore_server::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Load configuration
    let config = Settings::new()?;

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Configuration loaded successfully");
    info!("Starting server at {}:{}", config.server.host, config.server.port);

    // Initialize application state
    let state = AppState::new(config.clone())?;
    let heartbeat = state.start_heartbeat();
    let app_state = web::Data::new(state.clone());

    // Create and bind TCP listener
    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;

    info!(
        "WebSocket server ready to accept connections at ws://{}:{}{}",
        config.server.host, config.server.port, config.websocket.path
    );

    let cors_config = config.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(from_fn(websocket_gate))
            .wrap(build_cors(&cors_config))
            .app_data(app_state.clone())
            .route("/health", web::get().to(health_check))
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()))?;

    state.shutdown().await?;
    if let Err(e) = heartbeat.await {
        info!("Heartbeat task ended abnormally: {}", e);
    }

    Ok(())
}
