//! Authenticated HTTP gateway
//!
//! The second role of the sidecar: an HTTP reverse proxy that resolves
//! calls to deployed Modal functions, overwrites any inbound
//! `Authorization` header with the operator's token pair, and forwards
//! everything else either to cluster services (`/proxy/...`) or to the
//! backend API itself (catch-all).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use kube::Api;
use modal_client::CredentialStore;
use operator::crd::ModalFunction;
use tracing::{debug, error, info, warn};
use warp::http::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use warp::http::StatusCode;
use hyper::Body;
use warp::{Filter, Reply};

/// Default listen port of the gateway.
pub const DEFAULT_GATEWAY_PORT: u16 = 8080;

/// Total budget for one forwarded upstream call.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that must not travel across the proxy hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "host",
];

/// The gateway's shared state: a Kubernetes client for function
/// resolution, an HTTP client for forwarding, and the credential pair.
pub struct Gateway {
    kube: kube::Client,
    http: reqwest::Client,
    credentials: Arc<CredentialStore>,
    namespace: String,
    backend_base: String,
}

impl Gateway {
    /// Build a gateway forwarding to the default backend URL.
    pub fn new(
        kube: kube::Client,
        credentials: Arc<CredentialStore>,
        namespace: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Self::with_backend(kube, credentials, namespace, "https://api.modal.com")
    }

    /// Build a gateway forwarding to a specific backend URL.
    pub fn with_backend(
        kube: kube::Client,
        credentials: Arc<CredentialStore>,
        namespace: impl Into<String>,
        backend_base: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;
        Ok(Gateway {
            kube,
            http,
            credentials,
            namespace: namespace.into(),
            backend_base: backend_base.into().trim_end_matches('/').to_owned(),
        })
    }

    /// `POST /modal-function/{name}`: resolve the function URL from the
    /// in-cluster resource and call it with injected credentials.
    async fn call_function(
        &self,
        name: String,
        headers: HeaderMap,
        payload: serde_json::Value,
    ) -> warp::reply::Response {
        let api: Api<ModalFunction> = Api::namespaced(self.kube.clone(), &self.namespace);
        let function_url = match api.get(&name).await {
            Ok(function) => function.status.and_then(|s| s.function_url),
            Err(e) => {
                debug!(error = %e, %name, "Function lookup failed");
                None
            }
        };
        let function_url = match function_url {
            Some(url) => url,
            None => {
                return json_response(
                    StatusCode::NOT_FOUND,
                    &serde_json::json!({ "error": format!("Function {} not found", name) }),
                );
            }
        };

        info!(%name, url = %function_url, "Calling Modal function with injected auth");
        let request = self
            .http
            .post(&function_url)
            .headers(self.scrubbed_headers(&headers).await)
            .json(&payload);
        match request.send().await {
            Ok(response) => match response.json::<serde_json::Value>().await {
                Ok(result) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "status": "success",
                        "function": name,
                        "result": result,
                    }),
                ),
                Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
            },
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
        }
    }

    /// `/proxy/{service}/{port}[/{path}]`: plain forwarder into the
    /// cluster. Bare service names are completed to cluster DNS.
    async fn proxy_service(
        &self,
        service: String,
        port: u16,
        path: String,
        method: warp::http::Method,
        headers: HeaderMap,
        body: hyper::body::Bytes,
    ) -> warp::reply::Response {
        let service = qualify_service(&service);
        let target = format!("http://{}:{}/{}", service, port, path);
        debug!(%target, %method, "Proxying to cluster service");

        let request = self
            .http
            .request(method, &target)
            .headers(filter_headers(&headers))
            .body(body.to_vec());
        match request.send().await {
            Ok(response) => passthrough(response).await,
            Err(e) => {
                warn!(error = %e, %target, "Cluster service unreachable");
                json_response(
                    StatusCode::BAD_GATEWAY,
                    &serde_json::json!({
                        "error": format!("Failed to connect to {}:{}", service, port),
                        "details": e.to_string(),
                    }),
                )
            }
        }
    }

    /// Catch-all: forward to the backend API with injected credentials.
    async fn proxy_backend(
        &self,
        method: warp::http::Method,
        path: String,
        headers: HeaderMap,
        body: hyper::body::Bytes,
    ) -> warp::reply::Response {
        let target = format!("{}{}", self.backend_base, path);
        debug!(%target, %method, "Proxying to Modal API");
        let request = self
            .http
            .request(method, &target)
            .headers(self.scrubbed_headers(&headers).await)
            .body(body.to_vec());
        match request.send().await {
            Ok(response) => passthrough(response).await,
            Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
        }
    }

    /// Inbound headers minus the hop-by-hop set, with the operator's
    /// credentials overwriting any caller-supplied `Authorization`.
    async fn scrubbed_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut headers = filter_headers(inbound);
        let bearer = self.credentials.current().await.bearer();
        match bearer.parse() {
            Ok(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            Err(e) => error!(error = %e, "Credential pair not header-safe"),
        }
        headers
    }
}

fn filter_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let lowered = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lowered.as_str()) || lowered == "content-length" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn qualify_service(service: &str) -> String {
    if service.ends_with(".svc.cluster.local") {
        return service.to_owned();
    }
    match service.matches('.').count() {
        0 => format!("{}.default.svc.cluster.local", service),
        1 => format!("{}.svc.cluster.local", service),
        _ => service.to_owned(),
    }
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(value), status).into_response()
}

fn error_response(status: StatusCode, error: impl std::fmt::Display) -> warp::reply::Response {
    json_response(status, &serde_json::json!({ "error": error.to_string() }))
}

async fn passthrough(response: reqwest::Response) -> warp::reply::Response {
    let status = response.status();
    let content_type = response.headers().get(CONTENT_TYPE).cloned();
    let body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return error_response(StatusCode::BAD_GATEWAY, e),
    };
    let mut builder = warp::http::Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))
}

/// Serve the gateway until the process shuts down.
pub async fn serve(gateway: Arc<Gateway>, port: u16) {
    let health = warp::get()
        .and(warp::path("health"))
        .and(warp::path::end())
        .map(|| warp::reply::json(&serde_json::json!({ "status": "healthy" })));

    let function_gateway = Arc::clone(&gateway);
    let function = warp::post()
        .and(warp::path("modal-function"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::header::headers_cloned())
        .and(warp::body::json())
        .and_then(
            move |name: String, headers: HeaderMap, payload: serde_json::Value| {
                let gateway = Arc::clone(&function_gateway);
                async move {
                    Ok::<_, Infallible>(gateway.call_function(name, headers, payload).await)
                }
            },
        );

    let service_gateway = Arc::clone(&gateway);
    let service_proxy = warp::path("proxy")
        .and(warp::path::param::<String>())
        .and(warp::path::param::<u16>())
        .and(warp::path::tail())
        .and(warp::method())
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and_then(
            move |service: String,
                  port: u16,
                  tail: warp::path::Tail,
                  method: warp::http::Method,
                  headers: HeaderMap,
                  body: hyper::body::Bytes| {
                let gateway = Arc::clone(&service_gateway);
                async move {
                    Ok::<_, Infallible>(
                        gateway
                            .proxy_service(
                                service,
                                port,
                                tail.as_str().to_owned(),
                                method,
                                headers,
                                body,
                            )
                            .await,
                    )
                }
            },
        );

    let backend_gateway = Arc::clone(&gateway);
    let catchall = warp::method()
        .and(warp::path::full())
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and_then(move |method: warp::http::Method,
                        path: warp::path::FullPath,
                        headers: HeaderMap,
                        body: hyper::body::Bytes| {
            let gateway = Arc::clone(&backend_gateway);
            async move {
                Ok::<_, Infallible>(
                    gateway
                        .proxy_backend(method, path.as_str().to_owned(), headers, body)
                        .await,
                )
            }
        });

    let routes = health.or(function).or(service_proxy).or(catchall);
    info!(port, "Modal gateway listening");
    warp::serve(routes).run(([0, 0, 0, 0], port)).await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut inbound = HeaderMap::new();
        inbound.insert("connection", "keep-alive".parse().unwrap());
        inbound.insert("transfer-encoding", "chunked".parse().unwrap());
        inbound.insert("host", "gateway.default".parse().unwrap());
        inbound.insert("x-request-id", "abc-123".parse().unwrap());
        inbound.insert(AUTHORIZATION, "Bearer user-token".parse().unwrap());

        let filtered = filter_headers(&inbound);
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("host").is_none());
        assert_eq!(filtered.get("x-request-id").unwrap(), "abc-123");
        // Authorization passes the filter; injection overwrites it later.
        assert_eq!(filtered.get(AUTHORIZATION).unwrap(), "Bearer user-token");
    }

    #[tokio::test]
    async fn injection_overwrites_caller_authorization() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("MODAL_TOKEN_ID"), "ak-123").unwrap();
        std::fs::write(dir.path().join("MODAL_TOKEN_SECRET"), "as-456").unwrap();
        let store = CredentialStore::load(dir.path()).await.unwrap();

        let mut inbound = HeaderMap::new();
        inbound.insert(AUTHORIZATION, "Bearer user-token".parse().unwrap());

        let mut headers = filter_headers(&inbound);
        let bearer = store.current().await.bearer();
        headers.insert(AUTHORIZATION, bearer.parse().unwrap());

        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer ak-123:as-456");
        assert_eq!(headers.get_all(AUTHORIZATION).iter().count(), 1);
    }

    #[test]
    fn service_names_are_qualified() {
        assert_eq!(
            qualify_service("minio"),
            "minio.default.svc.cluster.local"
        );
        assert_eq!(
            qualify_service("mysql.payments"),
            "mysql.payments.svc.cluster.local"
        );
        assert_eq!(
            qualify_service("mysql.payments.svc.cluster.local"),
            "mysql.payments.svc.cluster.local"
        );
    }
}
