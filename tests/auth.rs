//! Authentication flows against the in-process registry: anonymous
//! access, HTTP Basic, and the bearer token exchange with caching.

mod common;

use std::sync::atomic::Ordering;

use common::{AuthMode, MockRegistry, Options, MOCK_TOKEN};
use oci_registry_client::client::{Client, ClientConfig, ClientProtocol};
use oci_registry_client::errors::OciDistributionError;
use oci_registry_client::manifest::OCI_IMAGE_MEDIA_TYPE;
use oci_registry_client::secrets::RegistryAuth;
use oci_registry_client::{Reference, RegistryOperation};

const FIXTURE_MANIFEST: &[u8] = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a","size":2},"layers":[]}"#;

fn http_client() -> Client {
    Client::new(ClientConfig {
        protocol: ClientProtocol::Http,
        ..Default::default()
    })
}

fn reference(registry: &MockRegistry) -> Reference {
    format!("{}/secured:latest", registry.addr)
        .parse()
        .expect("reference parses")
}

fn basic(username: &str, password: &str) -> RegistryAuth {
    RegistryAuth::Basic(username.to_string(), password.to_string())
}

#[test]
fn auth_variants_carry_their_credentials() {
    match basic("testuser", "testpass") {
        RegistryAuth::Basic(username, password) => {
            assert_eq!(username, "testuser");
            assert_eq!(password, "testpass");
        }
        _ => panic!("expected Basic"),
    }
    match RegistryAuth::Bearer("tok".to_string()) {
        RegistryAuth::Bearer(token) => assert_eq!(token, "tok"),
        _ => panic!("expected Bearer"),
    }
}

#[tokio::test]
async fn anonymous_requests_send_no_authorization_header() {
    let registry = MockRegistry::spawn().await;
    registry.add_manifest("secured", "latest", OCI_IMAGE_MEDIA_TYPE, FIXTURE_MANIFEST);

    let client = http_client();
    client
        .pull_manifest(&reference(&registry), &RegistryAuth::Anonymous)
        .await
        .expect("open registry accepts anonymous pulls");

    assert!(registry.manifest_requests() > 0);
    assert_eq!(registry.last_manifest_authorization(), None);
}

#[tokio::test]
async fn basic_credentials_ride_on_every_request() {
    let registry = MockRegistry::spawn_with(Options {
        auth: AuthMode::Basic {
            username: "testuser".to_string(),
            password: "testpass".to_string(),
        },
        ..Default::default()
    })
    .await;
    registry.add_manifest("secured", "latest", OCI_IMAGE_MEDIA_TYPE, FIXTURE_MANIFEST);

    let client = http_client();
    client
        .pull_manifest(&reference(&registry), &basic("testuser", "testpass"))
        .await
        .expect("correct credentials are accepted");

    let authorization = registry
        .last_manifest_authorization()
        .expect("credentials were sent");
    assert!(authorization.starts_with("Basic "));
}

#[tokio::test]
async fn wrong_basic_credentials_fail_terminally() {
    let registry = MockRegistry::spawn_with(Options {
        auth: AuthMode::Basic {
            username: "testuser".to_string(),
            password: "testpass".to_string(),
        },
        ..Default::default()
    })
    .await;
    registry.add_manifest("secured", "latest", OCI_IMAGE_MEDIA_TYPE, FIXTURE_MANIFEST);

    let client = http_client();
    let err = client
        .pull_manifest(&reference(&registry), &basic("testuser", "wrong"))
        .await
        .expect_err("wrong credentials are rejected");
    assert!(matches!(
        err,
        OciDistributionError::AuthenticationFailed(_)
    ));
}

#[tokio::test]
async fn bearer_challenge_is_answered_once_and_cached() {
    let registry = MockRegistry::spawn_with(Options {
        auth: AuthMode::Bearer { credentials: None },
        ..Default::default()
    })
    .await;
    registry.add_manifest("secured", "latest", OCI_IMAGE_MEDIA_TYPE, FIXTURE_MANIFEST);

    let client = http_client();
    let image = reference(&registry);

    client
        .pull_manifest(&image, &RegistryAuth::Anonymous)
        .await
        .expect("token exchange succeeds");
    assert_eq!(registry.counters.token_requests.load(Ordering::SeqCst), 1);

    // The cached token is reused: no second trip to the token endpoint.
    client
        .pull_manifest(&image, &RegistryAuth::Anonymous)
        .await
        .expect("second pull reuses the cached token");
    assert_eq!(registry.counters.token_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn basic_credentials_are_forwarded_to_the_token_endpoint() {
    let registry = MockRegistry::spawn_with(Options {
        auth: AuthMode::Bearer {
            credentials: Some(("testuser".to_string(), "testpass".to_string())),
        },
        ..Default::default()
    })
    .await;
    registry.add_manifest("secured", "latest", OCI_IMAGE_MEDIA_TYPE, FIXTURE_MANIFEST);

    let client = http_client();
    client
        .pull_manifest(&reference(&registry), &basic("testuser", "testpass"))
        .await
        .expect("token endpoint accepts the forwarded credentials");
    assert_eq!(registry.counters.token_requests.load(Ordering::SeqCst), 1);

    let client = http_client();
    let err = client
        .pull_manifest(&reference(&registry), &basic("testuser", "wrong"))
        .await
        .expect_err("token endpoint rejects bad credentials");
    assert!(matches!(
        err,
        OciDistributionError::AuthenticationFailed(_)
    ));
}

#[tokio::test]
async fn caller_supplied_bearer_token_skips_the_exchange() {
    let registry = MockRegistry::spawn_with(Options {
        auth: AuthMode::Bearer { credentials: None },
        ..Default::default()
    })
    .await;
    registry.add_manifest("secured", "latest", OCI_IMAGE_MEDIA_TYPE, FIXTURE_MANIFEST);

    let client = http_client();
    client
        .pull_manifest(
            &reference(&registry),
            &RegistryAuth::Bearer(MOCK_TOKEN.to_string()),
        )
        .await
        .expect("the supplied token is applied directly");

    assert_eq!(registry.counters.token_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stored_auth_is_used_implicitly() {
    let registry = MockRegistry::spawn_with(Options {
        auth: AuthMode::Basic {
            username: "testuser".to_string(),
            password: "testpass".to_string(),
        },
        ..Default::default()
    })
    .await;
    registry.add_manifest("secured", "latest", OCI_IMAGE_MEDIA_TYPE, FIXTURE_MANIFEST);

    let client = http_client();
    // Seed credentials up front; the later operation passes Anonymous and
    // still authenticates with the stored credential.
    client
        .store_auth(&registry.addr, basic("testuser", "testpass"))
        .await;

    client
        .pull_manifest(&reference(&registry), &RegistryAuth::Anonymous)
        .await
        .expect("stored credentials are picked up");
}

#[tokio::test]
async fn eager_auth_returns_the_token() {
    let registry = MockRegistry::spawn_with(Options {
        auth: AuthMode::Bearer { credentials: None },
        ..Default::default()
    })
    .await;

    let client = http_client();
    let token = client
        .auth(
            &reference(&registry),
            &RegistryAuth::Anonymous,
            RegistryOperation::Pull,
        )
        .await
        .expect("eager auth succeeds");
    assert_eq!(token.as_deref(), Some(MOCK_TOKEN));
}
