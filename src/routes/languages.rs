use actix_web::{HttpResponse, Responder, get, web};

use crate::intake::Intake;

#[get("/languages")]
pub async fn get_languages_handler(intake: web::Data<Intake>) -> impl Responder {
    HttpResponse::Ok().json(intake.languages())
}
