//! Plugin protocol server
//!
//! Serves the engine's remote network-driver protocol: HTTP POSTs with JSON
//! bodies on a Unix socket. Driver failures are answered with
//! `{"Err": "<message>"}`; bodies that do not decode get a 400.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use polyp_common::PolypResult;

use crate::driver::Driver;
use crate::types::{
    CreateEndpointRequest, CreateNetworkRequest, DeleteNetworkRequest, EndpointRequest,
    JoinRequest,
};

/// Endpoint type announced on activation
pub const NETWORK_DRIVER: &str = "NetworkDriver";

type Shared = State<Arc<Driver>>;

/// Builds the protocol router over `driver`
pub fn router(driver: Arc<Driver>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/NetworkDriver.GetCapabilities", post(get_capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(leave))
        .route("/NetworkDriver.DiscoverNew", post(accept))
        .route("/NetworkDriver.DiscoverDelete", post(accept))
        .route("/NetworkDriver.ProgramExternalConnectivity", post(accept))
        .route("/NetworkDriver.RevokeExternalConnectivity", post(accept))
        .with_state(driver)
}

/// Serves the protocol on `socket` until `shutdown` resolves
///
/// A stale socket file left by a previous run is removed first.
pub async fn serve<F>(socket: &Path, driver: Arc<Driver>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    match std::fs::remove_file(socket) {
        Ok(()) => debug!(socket = %socket.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(dir) = socket.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let listener = UnixListener::bind(socket)?;
    info!(socket = %socket.display(), "plugin listening");

    axum::serve(listener, router(driver))
        .with_graceful_shutdown(shutdown)
        .await
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "undecodable request body");
        (
            StatusCode::BAD_REQUEST,
            format!("Unable to decode JSON payload: {e}"),
        )
            .into_response()
    })
}

fn error_reply(message: String) -> Response {
    Json(json!({ "Err": message })).into_response()
}

fn reply<T: Serialize>(result: PolypResult<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_reply(e.to_string()),
    }
}

fn empty_reply(result: PolypResult<()>) -> Response {
    reply(result.map(|()| json!({})))
}

async fn activate() -> Json<Value> {
    debug!("activation handshake");
    Json(json!({ "Implements": [NETWORK_DRIVER] }))
}

async fn get_capabilities(State(driver): Shared) -> Response {
    Json(driver.get_capabilities()).into_response()
}

async fn create_network(State(driver): Shared, body: Bytes) -> Response {
    match decode::<CreateNetworkRequest>(&body) {
        Ok(rq) => empty_reply(driver.create_network(rq).await),
        Err(rejection) => rejection,
    }
}

async fn delete_network(State(driver): Shared, body: Bytes) -> Response {
    match decode::<DeleteNetworkRequest>(&body) {
        Ok(rq) => empty_reply(driver.delete_network(rq).await),
        Err(rejection) => rejection,
    }
}

async fn create_endpoint(State(driver): Shared, body: Bytes) -> Response {
    match decode::<CreateEndpointRequest>(&body) {
        Ok(rq) => reply(driver.create_endpoint(rq).await),
        Err(rejection) => rejection,
    }
}

async fn delete_endpoint(State(driver): Shared, body: Bytes) -> Response {
    match decode::<EndpointRequest>(&body) {
        Ok(rq) => empty_reply(driver.delete_endpoint(rq).await),
        Err(rejection) => rejection,
    }
}

async fn endpoint_info(State(driver): Shared, body: Bytes) -> Response {
    match decode::<EndpointRequest>(&body) {
        Ok(rq) => reply(driver.endpoint_info(rq).await),
        Err(rejection) => rejection,
    }
}

async fn join(State(driver): Shared, body: Bytes) -> Response {
    match decode::<JoinRequest>(&body) {
        Ok(rq) => reply(driver.join(rq).await),
        Err(rejection) => rejection,
    }
}

async fn leave(State(driver): Shared, body: Bytes) -> Response {
    match decode::<EndpointRequest>(&body) {
        Ok(rq) => empty_reply(driver.leave(rq).await),
        Err(rejection) => rejection,
    }
}

async fn accept() -> Json<Value> {
    Json(json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::NetworkRegistry;
    use crate::provisioner::Provisioner;
    use crate::types::Scope;
    use axum::body::Body;
    use axum::http::Request;
    use polyp_store::MemoryStore;
    use polyp_test::{
        delete_network_request, endpoint_ref, endpoint_request, join_request, MockLinks,
        NetworkRequest,
    };
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    fn app() -> (Arc<MockLinks>, Router) {
        let links = Arc::new(MockLinks::new().with_physical("eth0"));
        let provisioner = Arc::new(Provisioner::new(links.clone(), "eth0"));
        let networks = NetworkRegistry::new(Arc::new(MemoryStore::new()), provisioner, "polyp");
        let driver = Arc::new(Driver::new(Scope::Local, 1500, networks));
        (links, router(driver))
    }

    async fn call(app: &Router, path: &str, body: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::post(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_activate() {
        let (_, app) = app();
        let (status, body) = call(&app, "/Plugin.Activate", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"Implements": ["NetworkDriver"]}));
    }

    #[tokio::test]
    async fn test_capabilities() {
        let (_, app) = app();
        let (_, body) = call(&app, "/NetworkDriver.GetCapabilities", "{}").await;
        assert_eq!(body, json!({"Scope": "local", "ConnectivityScope": "local"}));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_bad_request() {
        let (_, app) = app();
        let (status, _) = call(&app, "/NetworkDriver.CreateNetwork", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_driver_error_is_err_reply() {
        let (_, app) = app();
        let request = NetworkRequest::new("n1").without_options();
        let (status, body) = call(
            &app,
            "/NetworkDriver.CreateNetwork",
            &request.to_json().to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"Err": "parameter map not passed from engine"}));

        let (_, body) = call(
            &app,
            "/NetworkDriver.DeleteNetwork",
            &delete_network_request("ghost").to_string(),
        )
        .await;
        assert_eq!(body, json!({"Err": "no such network: ghost"}));
    }

    #[tokio::test]
    async fn test_lifecycle_over_http() {
        let (links, app) = app();
        let request = NetworkRequest::new("n1").with_option("vlan", "42");

        let (_, body) = call(
            &app,
            "/NetworkDriver.CreateNetwork",
            &request.to_json().to_string(),
        )
        .await;
        assert_eq!(body, json!({}));

        let (_, body) = call(
            &app,
            "/NetworkDriver.CreateEndpoint",
            &endpoint_request("n1", "e1", "10.42.0.2/16", "").to_string(),
        )
        .await;
        assert_eq!(body, json!({}));
        assert!(links.has_link("bran42"));

        let (_, info) = call(
            &app,
            "/NetworkDriver.EndpointOperInfo",
            &endpoint_ref("n1", "e1").to_string(),
        )
        .await;
        assert_eq!(info["Value"]["Address"], "10.42.0.2/16");

        let (_, joined) = call(
            &app,
            "/NetworkDriver.Join",
            &join_request("n1", "e1", "/var/run/docker/netns/abc").to_string(),
        )
        .await;
        assert_eq!(joined["InterfaceName"]["DstPrefix"], "eth");
        assert_eq!(joined["InterfaceName"]["SrcName"], info["Value"]["SandboxInterface"]);
        assert_eq!(joined["Gateway"], "10.42.0.1");

        let (_, body) = call(&app, "/NetworkDriver.Leave", &endpoint_ref("n1", "e1").to_string()).await;
        assert_eq!(body, json!({}));

        let (_, body) = call(
            &app,
            "/NetworkDriver.DeleteEndpoint",
            &endpoint_ref("n1", "e1").to_string(),
        )
        .await;
        assert_eq!(body, json!({}));
        assert!(!links.has_link("bran42"));

        let (_, body) = call(
            &app,
            "/NetworkDriver.DeleteNetwork",
            &delete_network_request("n1").to_string(),
        )
        .await;
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn test_noop_routes() {
        let (_, app) = app();
        for path in [
            "/NetworkDriver.DiscoverNew",
            "/NetworkDriver.DiscoverDelete",
            "/NetworkDriver.ProgramExternalConnectivity",
            "/NetworkDriver.RevokeExternalConnectivity",
        ] {
            let (status, body) = call(&app, path, "{}").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({}));
        }
    }

    #[tokio::test]
    async fn test_serve_removes_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("polyp.sock");
        std::fs::write(&socket, b"stale").unwrap();

        let links = Arc::new(MockLinks::new().with_physical("eth0"));
        let provisioner = Arc::new(Provisioner::new(links, "eth0"));
        let networks = NetworkRegistry::new(Arc::new(MemoryStore::new()), provisioner, "polyp");
        let driver = Arc::new(Driver::new(Scope::Local, 1500, networks));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let path = socket.clone();
        let server = tokio::spawn(async move {
            serve(&path, driver, async {
                let _ = rx.await;
            })
            .await
        });

        for _ in 0..100 {
            if tokio::net::UnixStream::connect(&socket).await.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(tokio::net::UnixStream::connect(&socket).await.is_ok());

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
