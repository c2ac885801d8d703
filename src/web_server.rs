use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::intake::Intake;
use crate::routes::{
    delete_run_handler, get_languages_handler, get_runs_handler, json_error_handler,
    post_run_handler,
};

/// Upper bound on a request body, which carries a whole test suite
const JSON_LIMIT: usize = 16 * 1024 * 1024;

pub fn build_server(server_config: ServerConfig, intake: Arc<Intake>) -> std::io::Result<Server> {
    let intake = web::Data::from(intake);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(intake.clone())
            .app_data(
                web::JsonConfig::default()
                    .limit(JSON_LIMIT)
                    .error_handler(json_error_handler),
            )
            .wrap(middleware::Logger::default())
            .service(post_run_handler)
            .service(delete_run_handler)
            .service(get_runs_handler)
            .service(get_languages_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
