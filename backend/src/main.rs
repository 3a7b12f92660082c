use std::env;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use appledx::config::AppConfig;
use appledx::history::{HistorySink, HttpHistorySink, LogHistorySink};
use appledx::pipeline::{ArtifactLoader, Classifier, ModelRegistry};
use appledx::routes::configure_routes;
use shared::ModelVariant;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = AppConfig::from_env().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let normalizer = config.pipeline.to_normalizer();
    let loader = ArtifactLoader::new(&config.model_dir).with_input_size(normalizer.size);
    log::info!("Loading models from {}", loader.root().display());
    let registry = Arc::new(ModelRegistry::new(loader));

    if config.preload_models {
        let loaded = registry.warm_up();
        log::info!("Preloaded {} of {} models", loaded, ModelVariant::all().len());
    }

    let classifier = Classifier::new(registry)
        .with_normalizer(normalizer)
        .with_limits(config.decode_limits())
        .with_timeout(config.inference_timeout);
    log::info!("Inference deadline: {:?}", classifier.timeout());

    let history: Arc<dyn HistorySink> = match &config.history_url {
        Some(url) => {
            let sink = HttpHistorySink::new(url.clone());
            log::info!("Recording history to {}", sink.url());
            Arc::new(sink)
        }
        None => {
            log::warn!("HISTORY_URL not set, history entries are only logged");
            Arc::new(LogHistorySink)
        }
    };

    let classifier = web::Data::new(classifier);
    let history = web::Data::from(history);
    let max_image_bytes = config.max_image_bytes;
    let bind_address = config.bind_address();

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(classifier.clone())
            .app_data(history.clone())
            .configure(|cfg| configure_routes(cfg, max_image_bytes))
    })
    .bind(&bind_address)?
    .run()
    .await
}
