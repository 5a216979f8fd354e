use std::io;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use device_numbering::config::Config;
use device_numbering::http;
use device_numbering::metrics::Metrics;
use device_numbering::redis_store::RedisStore;
use device_numbering::{AllocationStore, BatchAllocator};

#[actix_web::main]
async fn main() -> io::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let store: Arc<dyn AllocationStore> = {
        let redis_store = RedisStore::connect(&config.redis_url, config.staging_ttl)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
        Arc::new(redis_store)
    };
    let metrics = Arc::new(
        Metrics::new().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?,
    );
    let allocator = Arc::new(BatchAllocator::new(
        store,
        config.allocator.clone(),
        metrics.clone(),
    ));

    let allocator_data = web::Data::new(allocator);
    let metrics_data = web::Data::new(metrics);

    info!(
        addr = %config.bind_addr,
        port = config.port,
        max_batch_size = config.allocator.max_batch_size,
        "starting device numbering service"
    );
    HttpServer::new(move || {
        App::new()
            .app_data(allocator_data.clone())
            .app_data(metrics_data.clone())
            .configure(http::configure)
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await
}
