use actix_web::{HttpResponse, Responder, delete, get, post, web};

use super::{ErrorResponseWithMessage, submit_error_response};
use crate::intake::Intake;
use crate::model::RunRequest;

/// Grades a submission and responds with its report once every case finished
#[post("/runs")]
pub async fn post_run_handler(
    intake: web::Data<Intake>,
    body: web::Json<RunRequest>,
) -> impl Responder {
    match intake.submit(body.into_inner()).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => {
            log::info!("Run rejected: {e}");
            submit_error_response(&e)
        }
    }
}

#[delete("/runs/{run_id}")]
pub async fn delete_run_handler(
    intake: web::Data<Intake>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let run_id = path.into_inner().0;
    if intake.cancel(&run_id) {
        HttpResponse::Ok().finish()
    } else {
        HttpResponse::NotFound().json(ErrorResponseWithMessage {
            reason: "ERR_NOT_FOUND",
            code: 3,
            message: format!("Run {run_id} not found."),
        })
    }
}

#[get("/runs")]
pub async fn get_runs_handler(intake: web::Data<Intake>) -> impl Responder {
    HttpResponse::Ok().json(intake.active_runs())
}
