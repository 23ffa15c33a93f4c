pub mod health;
pub mod shared;
pub mod videos;

use actix_web::web;

/// Mounts every route under `/api/v1`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .configure(videos::configure)
            .configure(health::configure),
    );
}
