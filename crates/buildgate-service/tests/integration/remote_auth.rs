use std::time::Duration;

use reqwest::StatusCode;
use buildgate_service::auth::{
    AuthenticationMetadata, HeaderForwardingAuthenticator, RemoteAuthenticator, RemoteAuthorizer,
};
use buildgate_service::caching::DecisionCacheConfig;
use buildgate_service::{GatewayError, InstanceName};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{decision_service, system_clock, DecisionServer};

fn headers(authorization: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_static(authorization));
    headers.insert("x-ignored", HeaderValue::from_static("secret"));
    headers
}

fn authenticator(server: &DecisionServer, timeout: Duration) -> HeaderForwardingAuthenticator {
    let service = decision_service(&server.url(), timeout);
    let remote = RemoteAuthenticator::new(
        service,
        json!({"realm": "ci"}),
        DecisionCacheConfig::default(),
        system_clock(),
    );
    HeaderForwardingAuthenticator::new(std::sync::Arc::new(remote), &["authorization".into()])
        .unwrap()
}

#[tokio::test]
async fn test_authenticate_over_http() {
    let server = DecisionServer::allow_all();
    let authenticator = authenticator(&server, Duration::from_secs(5));
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let metadata = authenticator
            .authenticate(&cancel, &headers("Bearer alice"))
            .await
            .unwrap();
        assert_eq!(metadata.public(), Some(&json!({"user": "Bearer alice"})));
    }
    // Allowed verdicts are cached for as long as the service says.
    assert_eq!(server.hits("authenticate"), 1);

    authenticator
        .authenticate(&cancel, &headers("Bearer bob"))
        .await
        .unwrap();
    assert_eq!(server.hits("authenticate"), 1);
}

#[tokio::test]
async fn test_authenticate_denied() {
    let server = DecisionServer::new(|_, _| {
        (StatusCode::OK, json!({"deny": "Token expired"}))
    });
    let authenticator = authenticator(&server, Duration::from_secs(5));
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let result = authenticator
            .authenticate(&cancel, &headers("Bearer alice"))
            .await;
        assert_eq!(
            result,
            Err(GatewayError::Unauthenticated("Token expired".into()))
        );
    }
    // Without an expiration time, the denial is not cached.
    assert_eq!(server.hits("authenticate"), 2);
}

#[tokio::test]
async fn test_authenticate_server_error() {
    let server = DecisionServer::new(|_, _| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"code": "unavailable", "message": "Overloaded"}),
        )
    });
    let authenticator = authenticator(&server, Duration::from_secs(5));

    let result = authenticator
        .authenticate(&CancellationToken::new(), &headers("Bearer alice"))
        .await;
    assert_eq!(
        result,
        Err(GatewayError::Unauthenticated(
            "Remote authentication failed: Overloaded".into()
        ))
    );
}

#[tokio::test]
async fn test_authenticate_timeout() {
    let server = DecisionServer::with_delay(Duration::from_secs(5), |_, _| {
        (StatusCode::OK, json!({"allow": {}}))
    });
    let authenticator = authenticator(&server, Duration::from_millis(100));

    let result = authenticator
        .authenticate(&CancellationToken::new(), &headers("Bearer alice"))
        .await;
    assert!(
        matches!(&result, Err(GatewayError::Unauthenticated(msg)) if msg.starts_with("Remote authentication failed")),
        "{result:?}"
    );
}

#[tokio::test]
async fn test_authenticate_cancelled() {
    let server = DecisionServer::with_delay(Duration::from_secs(5), |_, _| {
        (StatusCode::OK, json!({"allow": {}}))
    });
    let authenticator = authenticator(&server, Duration::from_secs(30));
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    };
    let headers = headers("Bearer alice");
    let (result, ()) = tokio::join!(authenticator.authenticate(&cancel, &headers), canceller);
    // The remote call observes the same token, so it may publish its failure first.
    match result {
        Err(GatewayError::Cancelled(_)) => {}
        Err(GatewayError::Unauthenticated(msg)) => assert!(msg.contains("cancelled"), "{msg}"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_authorize_over_http() {
    let server = DecisionServer::new(|_, request| {
        let user = &request["authentication_metadata"]["public"]["user"];
        let instance_name = request["instance_name"].as_str().unwrap_or_default();
        let response = if user == "alice" && instance_name.starts_with("linux") {
            json!({"allow": {}, "cache_expiration_time": buildgate_test::in_an_hour()})
        } else {
            json!({"deny": format!("No access to {instance_name:?}")})
        };
        (StatusCode::OK, response)
    });
    let service = decision_service(&server.url(), Duration::from_secs(5));
    let authorizer = RemoteAuthorizer::new(
        service,
        json!(null),
        DecisionCacheConfig::default(),
        system_clock(),
    );
    let metadata = AuthenticationMetadata::from_value(json!({"public": {"user": "alice"}})).unwrap();
    let instance_names = [
        InstanceName::new("linux/x86").unwrap(),
        InstanceName::new("macos").unwrap(),
    ];
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let results = authorizer
            .authorize(&cancel, &metadata, &instance_names)
            .await;
        assert_eq!(
            results,
            vec![
                Ok(()),
                Err(GatewayError::PermissionDenied(
                    "No access to \"macos\"".into()
                )),
            ]
        );
    }
    // The allowed instance is cached, the denied one is asked about every time.
    assert_eq!(server.hits("authorize"), 3);
}
