//! HTTP surface for batch creation.

use std::sync::Arc;

use std::fmt;

use actix_web::error::{InternalError, JsonPayloadError, PathError};
use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse, Responder, ResponseError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::batch_allocator::{AllocateError, BatchAllocator, ErrorKind};
use crate::metrics::Metrics;
use crate::model::{BatchAttributes, CreateBatchRequest, FactoryId};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBatchPayload {
    model_type: String,
    hardware_version: String,
    agent_code: String,
    production_date: NaiveDate,
    #[serde(default)]
    start_serial_number: Option<i64>,
    #[serde(default)]
    end_serial_number: Option<i64>,
}

impl CreateBatchPayload {
    fn into_request(self, factory_id: FactoryId) -> CreateBatchRequest {
        CreateBatchRequest {
            factory_id,
            attributes: BatchAttributes {
                model_type: self.model_type,
                hardware_version: self.hardware_version,
                agent_code: self.agent_code,
                production_date: self.production_date,
            },
            start_serial: self.start_serial_number,
            end_serial: self.end_serial_number,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    code: String,
    msg: String,
}

impl ResponseError for AllocateError {
    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Reference => StatusCode::NOT_FOUND,
            ErrorKind::Encoding => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Storage => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        if self.is_retryable() {
            response.insert_header((header::RETRY_AFTER, RETRY_AFTER_SECS));
        }
        response.json(ErrorBody {
            code: self.kind().as_str().to_string(),
            msg: self.to_string(),
        })
    }
}

const RETRY_AFTER_SECS: &str = "1";

/// Turns an extractor failure into a `validation` error body.
fn validation_error<E>(err: E, _req: &HttpRequest) -> actix_web::Error
where
    E: fmt::Debug + fmt::Display + 'static,
{
    let response = HttpResponse::BadRequest().json(ErrorBody {
        code: ErrorKind::Validation.as_str().to_string(),
        msg: err.to_string(),
    });
    InternalError::from_response(err, response).into()
}

async fn create_batch(
    factory_id: web::Path<FactoryId>,
    payload: web::Json<CreateBatchPayload>,
    allocator: web::Data<Arc<BatchAllocator>>,
) -> Result<impl Responder> {
    let request = payload.into_inner().into_request(factory_id.into_inner());
    let batch = allocator.create_batch(request).await?;
    Ok(HttpResponse::Created().json(batch))
}

async fn metrics(metrics: web::Data<Arc<Metrics>>) -> Result<impl Responder> {
    let body = metrics
        .render()
        .map_err(actix_web::error::ErrorInternalServerError)?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

/// Registers the routes. Expects `Arc<BatchAllocator>` and `Arc<Metrics>` as
/// app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(validation_error::<JsonPayloadError>))
        .app_data(web::PathConfig::default().error_handler(validation_error::<PathError>))
        .route(
            "/api/factories/{factoryId}/batches",
            web::post().to(create_batch),
        )
        .route("/metrics", web::get().to(metrics));
}
