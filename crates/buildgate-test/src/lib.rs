//! Helpers for testing the gateway.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using one of the mock servers, make sure that the server is held until all requests to
//!    it have been made. Servers stop serving when dropped, so assign them to a variable in the
//!    test function (e.g. `let decisions = DecisionServer::allow_all();`).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{self, Request};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Url;
use serde_json::{json, Value};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the gateway crates and mutes all other
///    logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("buildgate=trace,buildgate_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Hits = Arc<Mutex<BTreeMap<String, usize>>>;

/// Wraps `router` in a middleware counting requests per path.
fn count_hits(router: Router, hits: Hits) -> Router {
    let counter = move |request: Request, next: Next| {
        let hits = hits.clone();
        async move {
            {
                let mut hits = hits.lock().unwrap();
                *hits.entry(request.uri().path().to_owned()).or_default() += 1;
            }
            next.run(request).await
        }
    };
    router.layer(middleware::from_fn(counter))
}

/// The decision a [`DecisionServer`] makes for a request: a status code and a JSON body.
pub type Decide = Arc<dyn Fn(&str, &Value) -> (StatusCode, Value) + Send + Sync>;

/// A mock remote decision service.
///
/// It serves `POST /authenticate` and `POST /authorize`, and answers both with the decision of a
/// closure that is passed the endpoint name and the JSON request.
pub struct DecisionServer {
    server: Server,
    hits: Hits,
}

impl DecisionServer {
    pub fn new<F>(decide: F) -> Self
    where
        F: Fn(&str, &Value) -> (StatusCode, Value) + Send + Sync + 'static,
    {
        Self::with_delay(Duration::ZERO, decide)
    }

    /// Creates a decision service that takes `delay` to answer every request.
    pub fn with_delay<F>(delay: Duration, decide: F) -> Self
    where
        F: Fn(&str, &Value) -> (StatusCode, Value) + Send + Sync + 'static,
    {
        let decide: Decide = Arc::new(decide);
        let handler = |endpoint: &'static str| {
            let decide = decide.clone();
            move |Json(request): Json<Value>| {
                let decide = decide.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    let (status, body) = decide(endpoint, &request);
                    (status, Json(body))
                }
            }
        };

        let router = Router::new()
            .route("/authenticate", post(handler("authenticate")))
            .route("/authorize", post(handler("authorize")));

        let hits = Hits::default();
        let server = Server::with_router(count_hits(router, hits.clone()));
        Self { server, hits }
    }

    /// Allows every request, with verdicts valid for an hour.
    ///
    /// Clients are authenticated with the value of their `authorization` header as the user.
    pub fn allow_all() -> Self {
        Self::new(|endpoint, request| {
            let payload = match endpoint {
                "authenticate" => {
                    let user = &request["request_metadata"]["authorization"][0];
                    json!({"public": {"user": user}})
                }
                _ => json!({}),
            };
            (
                StatusCode::OK,
                json!({"allow": payload, "cache_expiration_time": in_an_hour()}),
            )
        })
    }

    /// Returns the number of requests made to `endpoint` since the last call.
    pub fn hits(&self, endpoint: &str) -> usize {
        let path = format!("/{endpoint}");
        self.hits.lock().unwrap().remove(&path).unwrap_or_default()
    }

    /// Returns the base URL of the service.
    pub fn url(&self) -> Url {
        self.server.url("/")
    }
}

/// An RFC 3339 timestamp one hour from now.
pub fn in_an_hour() -> String {
    (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339()
}

/// A mock execution backend speaking the gateway's HTTP protocol.
///
/// - `GET /capabilities/<instance>` echoes the instance name in the capabilities.
/// - `POST /execute` streams two operations named after the action digest, the second one done.
/// - `POST /operations/<name>` streams one finished operation, or fails with `not_found` if the
///   name is `missing`.
pub struct BackendServer {
    server: Server,
    hits: Hits,
}

impl BackendServer {
    /// Creates a backend that identifies itself as `name` in all responses.
    pub fn new(name: &'static str) -> Self {
        let capabilities = move |instance: String| async move {
            Json(json!({"backend": name, "instance_name": instance}))
        };

        let router = Router::new()
            .route("/capabilities", get(move || capabilities(String::new())))
            .route(
                "/capabilities/*instance",
                get(move |extract::Path(instance): extract::Path<String>| {
                    capabilities(instance)
                }),
            )
            .route(
                "/execute",
                post(move |Json(request): Json<Value>| async move {
                    let hash = request["action_digest"]["hash"].as_str().unwrap_or_default();
                    let operation = format!("{name}-{hash}");
                    ndjson(&[
                        json!({"operation": {"name": operation, "done": false}}),
                        json!({"operation": {"name": operation, "done": true,
                                             "response": {"backend": name}}}),
                    ])
                }),
            )
            .route(
                "/operations/*name",
                post(move |extract::Path(operation): extract::Path<String>| async move {
                    if operation == "missing" {
                        let error = json!({"code": "not_found", "message": "Unknown operation"});
                        return (StatusCode::NOT_FOUND, Json(error)).into_response();
                    }
                    ndjson(&[json!({"operation": {"name": operation, "done": true,
                                                  "response": {"backend": name}}})])
                }),
            );

        let hits = Hits::default();
        let server = Server::with_router(count_hits(router, hits.clone()));
        Self { server, hits }
    }

    /// Returns the number of requests made to the backend since the last call.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the base URL of the backend.
    pub fn url(&self) -> Url {
        self.server.url("/")
    }
}

fn ndjson(frames: &[Value]) -> Response {
    let mut body = String::new();
    for frame in frames {
        body.push_str(&frame.to_string());
        body.push('\n');
    }
    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}
