use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::auth::TokenManager;
use crate::config::GatewayConfig;
use crate::proxy::handlers;
use crate::proxy::middleware;
use crate::proxy::upstream::UpstreamClient;
use crate::store::AccountStore;

/// Shared dependencies, passed explicitly instead of living as globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: AccountStore,
    pub tokens: Arc<TokenManager>,
    pub upstream: Arc<UpstreamClient>,
}

impl AppState {
    pub fn new(config: Arc<GatewayConfig>, store: AccountStore) -> Self {
        let tokens = Arc::new(TokenManager::new(store.clone(), config.clone()));
        Self {
            config,
            store,
            tokens,
            upstream: Arc::new(UpstreamClient::new()),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::accounts::handle_root))
        .route("/health", get(handlers::accounts::handle_health))
        // Claude protocol
        .route("/v1/messages", post(handlers::claude::handle_messages))
        .route(
            "/v1/gemini/messages",
            post(handlers::gemini::handle_gemini_messages),
        )
        // OpenAI protocol
        .route(
            "/v1/chat/completions",
            post(handlers::openai::handle_chat_completions),
        )
        .route("/v1/models", get(handlers::openai::handle_list_models))
        // Account administration
        .route(
            "/v2/accounts",
            get(handlers::accounts::list_accounts).post(handlers::accounts::create_account),
        )
        .route(
            "/v2/accounts/:id",
            get(handlers::accounts::get_account)
                .patch(handlers::accounts::update_account)
                .delete(handlers::accounts::delete_account),
        )
        .route(
            "/v2/accounts/:id/refresh",
            post(handlers::accounts::refresh_account),
        )
        .route(
            "/v2/accounts/:id/quota",
            get(handlers::accounts::account_quota),
        )
        // Gemini pool utilities
        .route(
            "/api/gemini/accounts",
            get(handlers::accounts::gemini_account_stats),
        )
        .route(
            "/api/gemini/oauth-callback",
            post(handlers::accounts::gemini_oauth_callback),
        )
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::cors_layer())
        .with_state(state)
}

/// Running gateway server with a shutdown handle.
pub struct GatewayServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl GatewayServer {
    pub async fn start(
        host: &str,
        port: u16,
        state: AppState,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let app = build_router(state);

        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind address {}: {}", addr, e))?;

        tracing::info!("Gateway listening on http://{}", addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            use hyper::server::conn::http1;
            use hyper_util::rt::TokioIo;
            use hyper_util::service::TowerToHyperService;

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let service = TowerToHyperService::new(app.clone());

                                tokio::task::spawn(async move {
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!("Connection finished: {:?}", err);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Gateway stopped listening");
                        break;
                    }
                }
            }
        });

        Ok((Self { shutdown_tx: Some(shutdown_tx) }, handle))
    }

    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
