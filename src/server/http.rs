//! Bundled HTTP listener.
//!
//! Serves the main config's address with axum. Requests are matched by exact
//! path against the `router` sub-config and handed to the named service's
//! [`Handler`]. Unknown paths and unknown services answer 404.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::{
    timeout::{RequestBodyTimeoutLayer, ResponseBodyTimeoutLayer, TimeoutLayer},
    trace::TraceLayer,
};

use crate::conf::{BindingConf, ServerConf, ServerType, ROUTER_CONF_NAME};
use crate::server::{advertised_host, Context, HandlerRegistry, Listener, ListenerError, ListenerFactory, Reply};

/// Largest request body handed to a handler.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// One entry of the `router` sub-config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteConf {
    pub path: String,
    pub service: String,
    /// Allowed methods; empty allows any.
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RouterConf {
    #[serde(default)]
    routers: Vec<RouteConf>,
}

/// Exact-path route table.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, RouteConf>,
}

impl RouteTable {
    /// Parse the `router` sub-config. An empty payload yields an empty table.
    pub fn parse(raw: &[u8]) -> Result<Self, ListenerError> {
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let conf: RouterConf = serde_json::from_slice(raw)
            .map_err(|e| ListenerError::Config(format!("router: {}", e)))?;

        let mut routes = HashMap::with_capacity(conf.routers.len());
        for mut route in conf.routers {
            if !route.path.starts_with('/') {
                return Err(ListenerError::Config(format!("route path '{}' must start with '/'", route.path)));
            }
            if route.service.is_empty() {
                return Err(ListenerError::Config(format!("route '{}' has no service", route.path)));
            }
            route.methods = route.methods.iter().map(|m| m.to_ascii_uppercase()).collect();
            if routes.contains_key(&route.path) {
                return Err(ListenerError::Config(format!("duplicate route '{}'", route.path)));
            }
            routes.insert(route.path.clone(), route);
        }
        Ok(Self { routes })
    }

    pub fn get(&self, path: &str) -> Option<&RouteConf> {
        self.routes.get(path)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Clone)]
struct AppState {
    routes: Arc<RouteTable>,
    handlers: Arc<HandlerRegistry>,
}

/// Builds [`HttpListener`]s sharing one handler registry.
#[derive(Debug, Clone)]
pub struct HttpListenerFactory {
    handlers: Arc<HandlerRegistry>,
}

impl HttpListenerFactory {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }
}

impl ListenerFactory for HttpListenerFactory {
    fn build(&self, conf: &ServerConf) -> Result<Box<dyn Listener>, ListenerError> {
        let routes = match conf.sub(ROUTER_CONF_NAME) {
            Some(raw) => RouteTable::parse(raw)?,
            None => RouteTable::default(),
        };
        Ok(Box::new(HttpListener::new(
            conf.server_type,
            conf.binding().clone(),
            routes,
            self.handlers.clone(),
        )))
    }
}

pub struct HttpListener {
    server_type: ServerType,
    binding: BindingConf,
    state: AppState,
    handle: Option<Handle>,
    serve_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl HttpListener {
    pub fn new(
        server_type: ServerType,
        binding: BindingConf,
        routes: RouteTable,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            server_type,
            binding,
            state: AppState { routes: Arc::new(routes), handlers },
            handle: None,
            serve_task: None,
            local_addr: None,
        }
    }

    /// Bound socket address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[allow(deprecated)]
    fn build_router(&self) -> Router {
        let binding = &self.binding;
        Router::new()
            .fallback(dispatch)
            .with_state(self.state.clone())
            .layer(RequestBodyTimeoutLayer::new(Duration::from_secs(binding.read_timeout_secs)))
            .layer(ResponseBodyTimeoutLayer::new(Duration::from_secs(binding.write_timeout_secs)))
            .layer(TimeoutLayer::new(Duration::from_secs(binding.read_header_timeout_secs)))
            .layer(TraceLayer::new_for_http())
    }
}

#[async_trait]
impl Listener for HttpListener {
    async fn start(&mut self) -> Result<(), ListenerError> {
        if self.handle.is_some() {
            return Err(ListenerError::AlreadyStarted);
        }
        let address = self.binding.bind_address();

        // TLS material is loaded before binding so a bad cert leaves no socket behind.
        let tls = match &self.binding.tls {
            Some(tls) => Some(
                RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                    .await
                    .map_err(|source| ListenerError::Tls {
                        cert: tls.cert_path.clone(),
                        key: tls.key_path.clone(),
                        source,
                    })?,
            ),
            None => None,
        };

        let bind_err = |source| ListenerError::Bind { address: address.clone(), source };
        let listener = tokio::net::TcpListener::bind(&address).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        let listener = listener.into_std().map_err(bind_err)?;

        let app = self.build_router().into_make_service();
        let handle = Handle::new();
        let server_type = self.server_type;

        let task = match tls {
            Some(config) => {
                let server = axum_server::tls_rustls::from_tcp_rustls(listener, config).handle(handle.clone());
                tokio::spawn(async move {
                    if let Err(e) = server.serve(app).await {
                        tracing::error!(server_type = %server_type, error = %e, "HTTPS server failed");
                    }
                })
            }
            None => {
                let server = axum_server::from_tcp(listener).handle(handle.clone());
                tokio::spawn(async move {
                    if let Err(e) = server.serve(app).await {
                        tracing::error!(server_type = %server_type, error = %e, "HTTP server failed");
                    }
                })
            }
        };

        tracing::info!(
            server_type = %self.server_type,
            address = %local_addr,
            tls = self.binding.tls.is_some(),
            routes = self.state.routes.len(),
            "HTTP listener started"
        );

        self.handle = Some(handle);
        self.serve_task = Some(task);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<(), ListenerError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.graceful_shutdown(Some(grace));

        if let Some(mut task) = self.serve_task.take() {
            // axum-server force-closes connections at `grace`; allow a little slack.
            let deadline = grace + Duration::from_millis(500);
            if tokio::time::timeout(deadline, &mut task).await.is_err() {
                tracing::warn!(server_type = %self.server_type, "HTTP listener did not drain in time, aborting");
                task.abort();
            }
        }
        tracing::info!(server_type = %self.server_type, address = %self.binding.address, "HTTP listener stopped");
        Ok(())
    }

    fn address(&self) -> &str {
        &self.binding.address
    }

    fn service_address(&self) -> String {
        let scheme = self.server_type.scheme(self.binding.tls.is_some());
        match self.local_addr {
            Some(bound) => {
                let reachable = SocketAddr::new(advertised_host(bound), bound.port());
                format!("{}://{}", scheme, reachable)
            }
            None => format!("{}://{}", scheme, self.binding.bind_address()),
        }
    }
}

impl Drop for HttpListener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
    }
}

async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().as_str().to_string();

    let Some(route) = state.routes.get(&path) else {
        tracing::debug!(path = %path, "No route matched");
        return reply_response(Reply::error(404, format!("no route for {}", path)));
    };
    if !route.methods.is_empty() && !route.methods.iter().any(|m| *m == method) {
        return reply_response(Reply::error(405, format!("method {} not allowed", method)));
    }
    let Some(handler) = state.handlers.get(&route.service) else {
        tracing::warn!(path = %path, service = %route.service, "Route names an unknown service");
        return reply_response(Reply::error(404, format!("service '{}' not found", route.service)));
    };

    let query = Query::<BTreeMap<String, String>>::try_from_uri(request.uri())
        .map(|q| q.0)
        .unwrap_or_default();
    let headers = request
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => return reply_response(Reply::error(400, format!("unreadable body: {}", e))),
    };

    let ctx = Context {
        service: route.service.clone(),
        method,
        path,
        query,
        headers,
        body,
    };
    reply_response(handler.handle(ctx).await)
}

fn reply_response(reply: Reply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if reply.body.is_null() {
        return (status, Body::empty()).into_response();
    }
    (status, Json(reply.body)).into_response()
}
