use crate::cache::MirrorCache;
use crate::config::Config;
use crate::coordinator::CacheCoordinator;
use crate::fetcher::{OriginFetcher, HOP_HEADER};
use crate::pipeline::{MirrorPipeline, MirrorResponse};
use crate::recursion::{InboundSignals, MirrorHostGuard};
use crate::tls::load_rustls_config;
use crate::transform::Rewriter;
use crate::util::{MirrorError, Result};

use actix_web::{
    http::{
        header::{HeaderName, HeaderValue, USER_AGENT},
        Method, StatusCode,
    },
    middleware::Logger,
    web, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use log::{debug, info};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct AppState {
    pipeline: Arc<MirrorPipeline>,
}

/// splits `/<base host>/<rest>?<query>` into the base host and the
/// translated address (everything after the leading `/`)
pub fn dispatch_target(path_and_query: &str) -> Option<(String, String)> {
    let translated = path_and_query.strip_prefix('/')?;
    let base_host = translated
        .split(|c: char| c == '/' || c == '?')
        .next()
        .filter(|host| !host.is_empty())?;
    Some((base_host.to_string(), translated.to_string()))
}

fn inbound_signals(req: &HttpRequest, base_host: &str) -> InboundSignals {
    InboundSignals {
        base_host: base_host.to_string(),
        user_agent: req
            .headers()
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        hop_marker: req.headers().contains_key(HOP_HEADER),
    }
}

fn render(response: MirrorResponse) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    for (name, value) in &response.headers {
        // actix computes the length of the (possibly rewritten) body itself
        if name == "content-length" {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                builder.insert_header((name, value));
            }
            _ => debug!("dropping unrepresentable header {}", name),
        }
    }
    builder.insert_header((
        "x-mirror-cache",
        if response.cache_hit { "HIT" } else { "MISS" },
    ));
    builder.body(response.body)
}

async fn mirror_request(req: HttpRequest, state: web::Data<AppState>) -> impl Responder {
    let start_time = Instant::now();

    if req.method() != Method::GET {
        return HttpResponse::MethodNotAllowed().finish();
    }

    let path_and_query = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
    let Some((base_host, translated_address)) = dispatch_target(path_and_query) else {
        return HttpResponse::NotFound().body("not found");
    };

    debug!(
        "user-agent = {:?}, referer = {:?}",
        req.headers().get(USER_AGENT),
        req.headers().get("referer")
    );

    let signals = inbound_signals(&req, &base_host);
    match state
        .pipeline
        .handle(&base_host, &translated_address, &signals)
        .await
    {
        Some(response) => {
            info!(
                "{} {} -> {} {}ms{}",
                req.method(),
                req.uri(),
                response.status,
                start_time.elapsed().as_millis(),
                if response.cache_hit { " (cached)" } else { "" }
            );
            render(response)
        }
        None => {
            info!(
                "{} {} -> 404 {}ms (not found)",
                req.method(),
                req.uri(),
                start_time.elapsed().as_millis()
            );
            HttpResponse::NotFound().body("not found")
        }
    }
}

async fn health_check(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "entries": state.pipeline.coordinator().entry_count(),
    }))
}

pub fn build_pipeline(config: &Config) -> Result<MirrorPipeline> {
    let options = Arc::new(config.mirror_options());
    let coordinator = CacheCoordinator::new(
        MirrorCache::new(config.cache_size_mb, options.cache_ttl),
        Arc::new(OriginFetcher::new(config)),
        Arc::new(Rewriter::new()?),
        options.clone(),
    );
    let guard = Arc::new(MirrorHostGuard::new(&config.mirror_hosts));
    Ok(MirrorPipeline::new(coordinator, guard, options))
}

pub async fn run(config: Config) -> Result<()> {
    config.validate()?;

    let app_state = web::Data::new(AppState {
        pipeline: Arc::new(build_pipeline(&config)?),
    });

    let num_workers = num_cpus::get();
    info!(
        "mirror starting on {} with {} workers, ttl {}s",
        config.listen_addr, num_workers, config.cache_ttl_seconds
    );

    let server_builder = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(Logger::new("%r %s %b %D ms"))
            .route("/health", web::get().to(health_check))
            .default_service(web::to(mirror_request))
    })
    .keep_alive(Duration::from_secs(75))
    .workers(num_workers);

    let server = match config.tls_paths() {
        Some((cert_path, key_path)) => {
            info!("tls is enabled.");
            let tls_config = load_rustls_config(cert_path, key_path)?;
            server_builder.bind_rustls(&config.listen_addr, tls_config)?
        }
        None => {
            info!("tls is disabled (http only).");
            server_builder.bind(&config.listen_addr)?
        }
    };

    server
        .shutdown_timeout(30)
        .run()
        .await
        .map_err(MirrorError::Io)
}
