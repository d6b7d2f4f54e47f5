use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_api::broker::Broker;
use realtime_api::collab::DataApiClient;
use realtime_api::config::{BrokerBackend, Config};
use realtime_api::gateway::registry::ConnectionRegistry;
use realtime_api::publisher::EventPublisher;
use realtime_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let broker = match config.broker_backend {
        BrokerBackend::Memory => Arc::new(Broker::in_process()),
        BrokerBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .expect("REDIS_URL checked in Config::from_env");
            Arc::new(
                Broker::shared(url)
                    .await
                    .expect("failed to connect to redis"),
            )
        }
    };
    let (publisher, _pump) = EventPublisher::spawn(broker.clone());

    let data_api = Arc::new(DataApiClient::new(&config.data_api_url));

    tracing::info!(
        backend = ?config.broker_backend,
        data_api = %config.data_api_url,
        "realtime-api configured"
    );

    let state = AppState {
        broker: broker.clone(),
        publisher,
        registry: Arc::new(ConnectionRegistry::new()),
        tokens: data_api.clone(),
        conversations: data_api,
        config: Arc::new(config),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(realtime_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "realtime-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Stop the sweep/listener tasks before the backend connections drop.
    broker.shutdown().await;
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("shutdown signal received");
}
