mod languages;
mod runs;

pub use languages::get_languages_handler;
pub use runs::{delete_run_handler, get_runs_handler, post_run_handler};

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse};
use serde::Serialize;

use crate::error::{SubmitError, ValidationError};

#[derive(Serialize)]
struct ErrorResponseWithMessage {
    reason: &'static str,
    code: u32,
    message: String,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponseWithMessage {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
        message: err.to_string(),
    });
    InternalError::from_response(err, response).into()
}

fn submit_error_response(err: &SubmitError) -> HttpResponse {
    match err {
        SubmitError::Validation(ValidationError::RunIdInUse(_)) => {
            HttpResponse::Conflict().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_STATE",
                code: 2,
                message: err.to_string(),
            })
        }
        SubmitError::Validation(_) => HttpResponse::BadRequest().json(ErrorResponseWithMessage {
            reason: "ERR_INVALID_ARGUMENT",
            code: 1,
            message: err.to_string(),
        }),
        SubmitError::Cancelled { .. } => HttpResponse::Conflict().json(ErrorResponseWithMessage {
            reason: "ERR_CANCELED",
            code: 4,
            message: err.to_string(),
        }),
    }
}
