//! HTTP surface: shared state, router assembly and the listener.

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::middleware::{from_fn, from_fn_with_state};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{CookiePolicy, IdentityProvider, SessionKeys, require_role, require_user, session_layer};
use crate::config::{Config, TlsConfig};
use crate::db::{Role, Store};
use crate::docker::DockerFacade;
use crate::error::ServerError;
use crate::files::FileStore;
use crate::system::SystemMonitor;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub docker: Arc<dyn DockerFacade>,
    pub files: FileStore,
    pub sessions: SessionKeys,
    pub cookies: CookiePolicy,
    pub identity: Arc<dyn IdentityProvider>,
    pub monitor: Arc<SystemMonitor>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Store,
        docker: Arc<dyn DockerFacade>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let files = FileStore::new(&config.volume_dir);
        let monitor = Arc::new(SystemMonitor::new(config.data_dir.clone()));
        Self {
            sessions: SessionKeys::new(&config.jwt_secret),
            cookies: CookiePolicy::from_config(&config),
            files,
            monitor,
            config: Arc::new(config),
            store: Arc::new(store),
            docker,
            identity,
        }
    }
}

/// Assemble the full API.
///
/// The session layer runs on everything; read routes require a session and
/// mutating routes require the admin role.
pub fn build_router(state: AppState) -> Result<Router, ServerError> {
    let cors = cors_layer(&state.config.allow_origin)?;

    let open = routes::auth::routes();

    let authenticated = Router::new()
        .merge(routes::auth::session_routes())
        .merge(routes::docker::user_routes())
        .merge(routes::files::read_routes())
        .merge(routes::system::routes())
        .route_layer(from_fn(require_user));

    let admin = Router::new()
        .merge(routes::docker::admin_routes())
        .merge(routes::files::write_routes())
        .merge(routes::users::routes())
        .route_layer(from_fn_with_state(Role::Admin, require_role));

    Ok(Router::new()
        .merge(open)
        .merge(authenticated)
        .merge(admin)
        .layer(from_fn_with_state(state.sessions.clone(), session_layer))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn cors_layer(allow_origin: &str) -> Result<CorsLayer, ServerError> {
    let origin = HeaderValue::from_str(allow_origin).map_err(|e| ServerError::StartupFailed {
        reason: format!("invalid allow origin '{}': {}", allow_origin, e),
    })?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::CACHE_CONTROL,
            header::CONNECTION,
            HeaderName::from_static("transfer-encoding"),
        ])
        .allow_credentials(true))
}

/// Configuration for the gateway listener.
pub struct GatewayServerConfig {
    /// Address to bind the server to.
    pub addr: SocketAddr,
    /// Serve HTTPS with these PEM files when set.
    pub tls: Option<TlsConfig>,
}

/// The gateway's HTTP(S) server.
///
/// Route fragments are accumulated with `add_routes()`, then `start()` binds
/// the listener and spawns the server task.
pub struct GatewayServer {
    config: GatewayServerConfig,
    routes: Vec<Router>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl GatewayServer {
    pub fn new(config: GatewayServerConfig) -> Self {
        Self {
            config,
            routes: Vec::new(),
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Accumulate a route fragment. Each fragment should already have its
    /// state applied via `.with_state()`.
    pub fn add_routes(&mut self, router: Router) {
        self.routes.push(router);
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener, merge all route fragments, and spawn the server.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        let mut app = Router::new();
        for fragment in self.routes.drain(..) {
            app = app.merge(fragment);
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let (addr, handle) = match &self.config.tls {
            None => {
                let listener = tokio::net::TcpListener::bind(self.config.addr)
                    .await
                    .map_err(|e| bind_failed(self.config.addr, e))?;
                let addr = listener
                    .local_addr()
                    .map_err(|e| bind_failed(self.config.addr, e))?;

                let handle = tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(async {
                            let _ = shutdown_rx.await;
                            tracing::info!("Gateway server shutting down");
                        })
                        .await
                    {
                        tracing::error!("Gateway server error: {}", e);
                    }
                });
                (addr, handle)
            }
            Some(tls) => {
                let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    &tls.cert_file,
                    &tls.key_file,
                )
                .await
                .map_err(|e| ServerError::Tls(format!("{}: {}", tls.cert_file.display(), e)))?;

                let listener = std::net::TcpListener::bind(self.config.addr)
                    .map_err(|e| bind_failed(self.config.addr, e))?;
                listener
                    .set_nonblocking(true)
                    .map_err(|e| bind_failed(self.config.addr, e))?;
                let addr = listener
                    .local_addr()
                    .map_err(|e| bind_failed(self.config.addr, e))?;

                let server_handle = axum_server::Handle::new();
                let shutdown_handle = server_handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown_rx.await;
                    tracing::info!("Gateway server shutting down");
                    shutdown_handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
                });

                let handle = tokio::spawn(async move {
                    if let Err(e) = axum_server::from_tcp_rustls(listener, rustls)
                        .handle(server_handle)
                        .serve(app.into_make_service())
                        .await
                    {
                        tracing::error!("Gateway server error: {}", e);
                    }
                });
                (addr, handle)
            }
        };

        tracing::info!(
            tls = self.config.tls.is_some(),
            "Gateway server listening on {}",
            addr
        );

        self.local_addr = Some(addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(handle);
        Ok(addr)
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

fn bind_failed(addr: SocketAddr, e: std::io::Error) -> ServerError {
    ServerError::StartupFailed {
        reason: format!("Failed to bind to {}: {}", addr, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auto_config() -> GatewayServerConfig {
        GatewayServerConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            tls: None,
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown_lifecycle() {
        let mut server = GatewayServer::new(auto_config());
        server.add_routes(Router::new().route("/ping", axum::routing::get(|| async { "pong" })));
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));

        let body = reqwest::get(format!("http://{}/ping", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");

        server.shutdown().await;
        assert!(server.handle.is_none());
        assert!(server.shutdown_tx.is_none());
    }

    #[tokio::test]
    async fn test_start_on_occupied_port_returns_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let occupied_addr = listener.local_addr().unwrap();

        let mut server = GatewayServer::new(GatewayServerConfig {
            addr: occupied_addr,
            tls: None,
        });
        match server.start().await {
            Err(ServerError::StartupFailed { reason }) => {
                assert!(reason.contains("Failed to bind"));
            }
            other => panic!("expected StartupFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_missing_tls_files_fail_startup() {
        let mut server = GatewayServer::new(GatewayServerConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            tls: Some(TlsConfig {
                cert_file: "/nonexistent/cert.pem".into(),
                key_file: "/nonexistent/key.pem".into(),
            }),
        });
        assert!(matches!(server.start().await, Err(ServerError::Tls(_))));
    }

    #[tokio::test]
    async fn test_shutdown_when_not_started_is_noop() {
        let mut server = GatewayServer::new(auto_config());
        server.shutdown().await;
    }

    #[test]
    fn test_invalid_origin_rejected() {
        assert!(cors_layer("http://ok.example.com").is_ok());
        assert!(cors_layer("bad\norigin").is_err());
    }
}
