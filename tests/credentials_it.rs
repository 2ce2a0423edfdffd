#![cfg(feature = "reqwest")]

// crates.io
use httpmock::prelude::*;
// self
use connect_auth::{
	_preludet::*,
	credentials::{RequestAttempt, RetryDirective, TokenProvider},
	error::Error,
	store::{MemoryStore, TokenStore},
	token::TokenSet,
};

fn expired_tokens() -> TokenSet {
	let issued = OffsetDateTime::now_utc() - Duration::hours(2);

	TokenSet::builder()
		.access_token("stale-access")
		.refresh_token("stale-refresh")
		.issued_at(issued)
		.expires_at(issued + Duration::hours(1))
		.build()
		.expect("Expired token fixture should build successfully.")
}

fn fresh_tokens() -> TokenSet {
	TokenSet::builder()
		.access_token("live-access")
		.refresh_token("live-refresh")
		.issued_now()
		.expires_in(Duration::hours(1))
		.build()
		.expect("Fresh token fixture should build successfully.")
}

fn request() -> connect_auth::credentials::AuthRequest {
	connect_auth::oauth::oauth2::http::Request::builder()
		.method("GET")
		.uri("https://api.example.com/printers")
		.body(Vec::new())
		.expect("Request fixture should build successfully.")
}

#[tokio::test]
async fn refresh_rotates_tokens_and_updates_the_store() {
	let server = MockServer::start_async().await;
	let engine = build_reqwest_test_engine(test_provider(&server.base_url()));
	let backend = MemoryStore::seeded(expired_tokens());
	let store: Arc<dyn TokenStore> = Arc::new(backend.clone());
	let credentials = engine.credentials_from(expired_tokens(), Some(store));
	let mock = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/token")
				.body_includes("grant_type=refresh_token")
				.body_includes("refresh_token=stale-refresh");
			then.status(200).header("content-type", "application/json").body(
				"{\"access_token\":\"access-new\",\"refresh_token\":\"refresh-new\",\
				 \"token_type\":\"bearer\",\"expires_in\":1800}",
			);
		})
		.await;
	let authorized = credentials
		.authorize(request())
		.await
		.expect("Authorize over an expired set should refresh and succeed.");

	mock.assert_async().await;

	assert_eq!(
		authorized
			.headers()
			.get("authorization")
			.and_then(|value| value.to_str().ok()),
		Some("Bearer access-new"),
	);

	let persisted = backend.snapshot().expect("Store should hold the rotated record.");

	assert_eq!(persisted.access_token.expose(), "access-new");
	assert_eq!(
		persisted.refresh_token.as_ref().map(|secret| secret.expose()),
		Some("refresh-new"),
	);
}

#[tokio::test]
async fn unrotated_refresh_response_keeps_the_prior_secret() {
	let server = MockServer::start_async().await;
	let engine = build_reqwest_test_engine(test_provider(&server.base_url()));
	let credentials = engine.credentials_from(expired_tokens(), None);
	let mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token").body_includes("grant_type=refresh_token");
			then.status(200).header("content-type", "application/json").body(
				"{\"access_token\":\"access-unrotated\",\"token_type\":\"bearer\",\
				 \"expires_in\":1800}",
			);
		})
		.await;
	let renewed = credentials.ensure_fresh().await.expect("Refresh should succeed.");

	mock.assert_async().await;

	assert_eq!(
		renewed.refresh_token.as_ref().map(|secret| secret.expose()),
		Some("stale-refresh"),
	);
}

#[tokio::test]
async fn rejected_refresh_token_requires_reauthentication() {
	let server = MockServer::start_async().await;
	let engine = build_reqwest_test_engine(test_provider(&server.base_url()));
	let backend = MemoryStore::seeded(expired_tokens());
	let store: Arc<dyn TokenStore> = Arc::new(backend.clone());
	let credentials = engine.credentials_from(expired_tokens(), Some(store));
	let mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(400)
				.header("content-type", "application/json")
				.body("{\"error\":\"invalid_grant\"}");
		})
		.await;
	let err = credentials
		.ensure_fresh()
		.await
		.expect_err("A rejected refresh token should fail the refresh.");

	assert!(matches!(err, Error::ReauthenticationRequired));
	assert!(credentials.needs_reauthentication());
	assert_eq!(backend.saves(), 0, "The stored record must stay untouched for diagnostics.");

	// No further network attempt happens until new credentials are installed.
	assert!(matches!(
		credentials.ensure_fresh().await,
		Err(Error::ReauthenticationRequired),
	));

	mock.assert_async().await;
}

#[tokio::test]
async fn unauthorized_response_forces_one_refresh_and_one_retry() {
	let server = MockServer::start_async().await;
	let engine = build_reqwest_test_engine(test_provider(&server.base_url()));
	let credentials = engine.credentials_from(fresh_tokens(), None);
	let mock = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/token")
				.body_includes("grant_type=refresh_token")
				.body_includes("refresh_token=live-refresh");
			then.status(200).header("content-type", "application/json").body(
				"{\"access_token\":\"access-forced\",\"refresh_token\":\"refresh-forced\",\
				 \"token_type\":\"bearer\",\"expires_in\":1800}",
			);
		})
		.await;
	let mut attempt = RequestAttempt::new();
	let directive = credentials
		.notify_unauthorized(&mut attempt)
		.await
		.expect("The first unauthorized notification should force a refresh.");

	mock.assert_async().await;

	assert_eq!(directive, RetryDirective::RetryOnce);

	let authorized = credentials
		.authorize(request())
		.await
		.expect("The retried request should carry the forced refresh result.");

	assert_eq!(
		authorized
			.headers()
			.get("authorization")
			.and_then(|value| value.to_str().ok()),
		Some("Bearer access-forced"),
	);

	// A second consecutive rejection for the same logical request is not
	// retried again.
	let err = credentials
		.notify_unauthorized(&mut attempt)
		.await
		.expect_err("The second unauthorized notification should give up.");

	assert!(matches!(err, Error::Authorization));
	mock.assert_async().await;
}

#[tokio::test]
async fn login_result_feeds_credentials_end_to_end() {
	let server = MockServer::start_async().await;
	let engine = build_reqwest_test_engine(test_provider(&server.base_url()));
	let _authorize_mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/authorize");
			then.status(200)
				.header("content-type", "application/json")
				.body("{\"code\":\"code-e2e\"}");
		})
		.await;
	let _token_mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token").body_includes("grant_type=authorization_code");
			then.status(200).header("content-type", "application/json").body(
				"{\"access_token\":\"access-e2e\",\"refresh_token\":\"refresh-e2e\",\
				 \"token_type\":\"bearer\",\"expires_in\":3600}",
			);
		})
		.await;
	let mut otp = |_rejected: u32| -> Option<String> { None };
	let tokens = engine
		.login("user@example.com", "hunter2", &mut otp)
		.await
		.expect("Login should succeed without a challenge.");
	let backend = MemoryStore::default();
	let store: Arc<dyn TokenStore> = Arc::new(backend.clone());
	let credentials = engine.credentials_from(tokens.clone(), Some(store));

	credentials.install(tokens).await.expect("Installing the login result should persist it.");

	assert_eq!(backend.saves(), 1);

	let authorized = credentials
		.authorize(request())
		.await
		.expect("A fresh login result should authorize without refreshing.");

	assert_eq!(
		authorized
			.headers()
			.get("authorization")
			.and_then(|value| value.to_str().ok()),
		Some("Bearer access-e2e"),
	);
	assert_eq!(credentials.metrics().attempts(), 0);
}
