use std::str::FromStr;
use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{Error, HttpResponse, web};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{StreamExt, TryStreamExt};
use log::{error, info, warn};
use serde_json::json;
use shared::{
    ClassificationResult, ErrorResponse, InferenceRequest, InferenceResponse, ModelVariant,
};

use crate::history::{HistoryEntry, HistorySink, content_digest};
use crate::pipeline::{Classifier, PipelineError};

const IMAGE_FIELD: &str = "image";
const CONTENT_URL_FIELD: &str = "content_url";

pub fn configure_routes(cfg: &mut web::ServiceConfig, max_image_bytes: usize) {
    // base64 inflates the payload by a third
    let json_limit = max_image_bytes / 3 * 4 + 4096;
    cfg.app_data(web::JsonConfig::default().limit(json_limit))
        .service(web::resource("/predict/{variant}").route(web::post().to(handle_predict)))
        .service(web::resource("/api/classify/{variant}").route(web::post().to(handle_classify)))
        .service(web::resource("/health").route(web::get().to(health)));
}

fn error_body(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse {
        error: message.into(),
    })
}

fn parse_variant(raw: &str) -> Result<ModelVariant, HttpResponse> {
    ModelVariant::from_str(raw).map_err(|_| {
        error_body(
            StatusCode::NOT_FOUND,
            format!("unknown model variant: {}", raw),
        )
    })
}

fn pipeline_error_response(err: &PipelineError) -> HttpResponse {
    let status = match err {
        PipelineError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_body(status, err.user_message())
}

/// Runs the classifier and, on success, records the result in the background.
async fn classify_and_record(
    classifier: &Classifier,
    history: web::Data<dyn HistorySink>,
    variant: ModelVariant,
    image_data: Vec<u8>,
    content_url: Option<String>,
) -> HttpResponse {
    let content_url = content_url.unwrap_or_else(|| content_digest(&image_data));

    match classifier.run(variant, image_data).await {
        Ok(result) => {
            info!(
                "{} prediction: {} ({}%){}",
                variant,
                result.predicted_class,
                result.confidence_text(),
                if result.is_healthy() { ", healthy" } else { "" }
            );
            spawn_history(history.into_inner(), variant, result.clone(), content_url);
            HttpResponse::Ok().json(InferenceResponse {
                result,
                model_type: variant,
            })
        }
        Err(e) => {
            match &e {
                PipelineError::Decode(_) => warn!("Rejected {} image: {}", variant, e),
                _ => error!("{} classification failed: {}", variant, e),
            }
            pipeline_error_response(&e)
        }
    }
}

fn spawn_history(
    sink: Arc<dyn HistorySink>,
    variant: ModelVariant,
    result: ClassificationResult,
    content_url: String,
) {
    let entry = HistoryEntry::new(variant, result, content_url);
    actix_web::rt::spawn(async move {
        if let Err(e) = sink.record(entry).await {
            error!("Failed to record history in background: {}", e);
        }
    });
}

async fn handle_predict(
    classifier: web::Data<Classifier>,
    history: web::Data<dyn HistorySink>,
    path: web::Path<String>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    let variant = match parse_variant(&path.into_inner()) {
        Ok(variant) => variant,
        Err(response) => return Ok(response),
    };
    let max_bytes = classifier.limits().max_image_bytes;

    let mut image_data: Option<Vec<u8>> = None;
    let mut content_url = None;

    while let Some(mut field) = payload.try_next().await? {
        let name = field.name().unwrap_or_default().to_string();
        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk?;
            // one byte past the limit is enough for the decoder to reject it
            if data.len() <= max_bytes {
                data.extend_from_slice(&chunk);
            }
        }
        match name.as_str() {
            IMAGE_FIELD => image_data = Some(data),
            CONTENT_URL_FIELD => {
                content_url = String::from_utf8(data)
                    .ok()
                    .map(|url| url.trim().to_string())
                    .filter(|url| !url.is_empty());
            }
            _ => {}
        }
    }

    let Some(image_data) = image_data else {
        return Ok(error_body(StatusCode::BAD_REQUEST, "No image file provided"));
    };

    Ok(classify_and_record(&classifier, history, variant, image_data, content_url).await)
}

async fn handle_classify(
    classifier: web::Data<Classifier>,
    history: web::Data<dyn HistorySink>,
    path: web::Path<String>,
    request: web::Json<InferenceRequest>,
) -> HttpResponse {
    let variant = match parse_variant(&path.into_inner()) {
        Ok(variant) => variant,
        Err(response) => return response,
    };
    let InferenceRequest {
        image_data,
        content_url,
    } = request.into_inner();

    // tolerate data URLs as produced by browsers and the mobile client
    let encoded = match image_data.split_once(";base64,") {
        Some((_, encoded)) => encoded,
        None => image_data.as_str(),
    };
    let image_data = match STANDARD.decode(encoded.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Invalid base64 payload for {}: {}", variant, e);
            return error_body(StatusCode::BAD_REQUEST, "invalid base64 image data");
        }
    };

    classify_and_record(&classifier, history, variant, image_data, content_url).await
}

async fn health(classifier: web::Data<Classifier>) -> HttpResponse {
    let registry = classifier.registry();
    let models: serde_json::Map<String, serde_json::Value> = ModelVariant::all()
        .into_iter()
        .map(|variant| (variant.to_string(), json!(registry.is_loaded(variant))))
        .collect();

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "models": models
    }))
}
