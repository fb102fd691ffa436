//! HTTP server implementation
//!
//! Accept loop on a hyper http1 connection per client, plus the request
//! router and the shared application state.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::cache::{spawn_sweep_task, CacheStore, FetchCoordinator};
use crate::config::{Args, OriginMode};
use crate::delivery::ProgressiveDeliverer;
use crate::retrieval::RetrievalOrchestrator;
use crate::routes::{self, BoxBody, RESOURCE_PREFIX};
use crate::services::{HttpMetadataResolver, HttpOrigin, MetadataResolver, NoMetadata, Origin};
use crate::types::Result;

/// Shared state for request handling
pub struct AppState {
    pub args: Args,
    pub cache: Arc<CacheStore>,
    pub coordinator: Arc<FetchCoordinator>,
    pub orchestrator: Arc<RetrievalOrchestrator>,
    pub origin: Origin,
    pub started_at: Instant,
}

impl AppState {
    /// Open the cache and wire up the configured origin and metadata service.
    pub async fn build(args: Args) -> Result<Self> {
        let cache = Arc::new(CacheStore::open(args.cache_config()).await?);

        let http_origin = Arc::new(HttpOrigin::new(&args.origin_url)?);
        let origin = match args.origin_mode {
            OriginMode::Destination => Origin::Destination(http_origin),
            OriginMode::Stream => Origin::Streaming(http_origin),
        };

        let metadata: Arc<dyn MetadataResolver> = match &args.metadata_url {
            Some(url) => Arc::new(HttpMetadataResolver::new(url, args.metadata_timeout())?),
            None => Arc::new(NoMetadata),
        };

        Ok(Self::assemble(args, cache, origin, metadata))
    }

    /// Build state around an already opened cache and explicit collaborators.
    pub fn assemble(
        args: Args,
        cache: Arc<CacheStore>,
        origin: Origin,
        metadata: Arc<dyn MetadataResolver>,
    ) -> Self {
        let coordinator = Arc::new(FetchCoordinator::new(Arc::clone(&cache), args.fetch_timeout()));
        let deliverer = ProgressiveDeliverer::new(args.delivery_chunk_size());
        let orchestrator = Arc::new(RetrievalOrchestrator::new(
            Arc::clone(&coordinator),
            origin.clone(),
            metadata,
            deliverer,
        ));

        Self {
            args,
            cache,
            coordinator,
            orchestrator,
            origin,
            started_at: Instant::now(),
        }
    }
}

/// Run the HTTP server until the process is stopped
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    info!("blob-relay listening on {}", state.args.listen);

    spawn_sweep_task(Arc::clone(&state.cache));
    info!(
        "Cache enabled (max {} entries, ttl {}s, scratch {})",
        state.cache.config().max_entries,
        state.cache.config().ttl.as_secs(),
        state.cache.config().scratch_dir.display()
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
pub async fn handle_request<B>(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<B>,
) -> std::result::Result<Response<BoxBody>, Infallible> {
    // Request bodies are never read
    let (parts, _) = req.into_parts();
    let path = parts.uri.path();

    debug!("[{}] {} {}", addr, parts.method, path);

    if let Some(raw_key) = path.strip_prefix(RESOURCE_PREFIX) {
        return Ok(routes::handle_resource_request(
            &parts.method,
            &parts.headers,
            raw_key,
            &state.orchestrator,
        )
        .await);
    }

    let response = match (&parts.method, path) {
        // Liveness check
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => {
            routes::health_check(&state).await
        }

        // Version info for deployment verification
        (&Method::GET, "/version") => routes::version_info(),

        _ => routes::not_found(path),
    };

    Ok(response)
}
