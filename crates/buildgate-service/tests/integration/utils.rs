use std::sync::Arc;
use std::time::Duration;

use buildgate_service::auth::{DecisionService, HttpDecisionService};
use buildgate_service::caching::{Clock, SystemClock};
use buildgate_service::utils::http::create_client;
use reqwest::{Client, Url};

pub use buildgate_test::{setup, BackendServer, DecisionServer};

/// A client with the default connect timeout of the gateway.
pub fn client() -> Client {
    setup();
    create_client(Duration::from_secs(1)).unwrap()
}

/// Creates a decision service talking to `url`, with requests timing out after `timeout`.
pub fn decision_service(url: &Url, timeout: Duration) -> Arc<dyn DecisionService> {
    Arc::new(HttpDecisionService::new(client(), url, timeout))
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
