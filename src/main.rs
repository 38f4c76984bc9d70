//! mirror-proxy - serves third-party sites through this host
//!
//! fetches origin pages, rewrites their links so every reference routes back
//! through the mirror, and caches the result for a fixed ttl:
//! - html/css link rewriting
//! - in-memory ttl cache with add-if-absent writes
//! - header sanitizing and loop protection
//! - optional TLS termination

mod cache;
mod config;
mod coordinator;
mod fetcher;
mod headers;
mod pipeline;
mod recursion;
mod server;
mod tls;
mod transform;
mod util;

use config::Config;
use log::error;

#[actix_web::main]
async fn main() {
    util::setup_logger();

    let config = Config::load();

    if let Err(e) = server::run(config).await {
        error!("mirror server stopped: {}", e);
        std::process::exit(1);
    }
}
