//! Liveness endpoint.
//!
//! `GET /` reports whether the solver holds a reserve snapshot and is
//! therefore able to answer quotes. Everything else is a 404.
use actix_web::{dev::Server, get, web, App, HttpResponse, HttpServer};
use serde_json::json;
use tracing::info;

use crate::reserves::ReserveStore;

#[get("/")]
async fn ready(store: web::Data<ReserveStore>) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "ready": store.initialized().await }))
}

/// Binds the liveness server. The returned [`Server`] future runs until
/// aborted.
pub fn serve(store: ReserveStore, port: u16) -> std::io::Result<Server> {
    info!(port, "Starting liveness endpoint");
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(store.clone()))
            .service(ready)
    })
    .bind(("0.0.0.0", port))?
    .run();
    Ok(server)
}
