use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use buildgate_service::metric;

/// Tag for requests that did not match any route.
const UNMATCHED: &str = "unmatched";

/// Returns the route template a request was matched against, such as `/operations/*name`.
///
/// Using the template instead of the path keeps instance and operation names out of the tags.
fn route(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map_or(UNMATCHED, MatchedPath::as_str)
        .to_owned()
}

/// Records the duration and status code of every response, tagged with its route.
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let route = route(&request);
    let start = Instant::now();

    let response = next.run(request).await;

    metric!(timer("requests.duration") = start.elapsed(), "route" => route.as_str());
    metric!(
        counter("responses.status_code") += 1,
        "route" => route.as_str(),
        "status" => response.status().as_str(),
    );
    response
}
