//! Request-authorization credentials with single-flight refresh coordination.

mod metrics;

pub use metrics::RefreshMetrics;

// crates.io
use oauth2::http::header::{AUTHORIZATION, HeaderValue};
// self
use crate::{
	_prelude::*,
	error::{ConfigError, NetworkError},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	store::TokenStore,
	token::{TokenSecret, TokenSet},
};

/// Boxed future returned by [`TokenProvider`] and [`TokenRefresher`] methods.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a + Send>>;

/// Request type flowing through [`TokenProvider::authorize`].
pub type AuthRequest = oauth2::HttpRequest;

/// Safety margin subtracted from `expires_at` to tolerate clock skew.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::seconds(60);

/// Capability interface the transport layer holds for request authorization.
pub trait TokenProvider
where
	Self: Send + Sync,
{
	/// Returns the request with a valid bearer header attached.
	///
	/// May suspend while a refresh is in flight; never issues a network call
	/// while the current token set is fresh.
	fn authorize(&self, request: AuthRequest) -> ProviderFuture<'_, AuthRequest>;

	/// Reacts to a request the service rejected as unauthorized despite an
	/// apparently valid token.
	///
	/// Forces one coordinated refresh and instructs the transport to retry the
	/// original request once; a second rejection for the same attempt surfaces
	/// [`Error::Authorization`] instead of looping.
	fn notify_unauthorized<'a>(
		&'a self,
		attempt: &'a mut RequestAttempt,
	) -> ProviderFuture<'a, RetryDirective>;
}

/// Per-logical-request bookkeeping enforcing the retry-once rule.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestAttempt {
	retried: bool,
}
impl RequestAttempt {
	/// Creates bookkeeping for a fresh logical request.
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether this attempt has already consumed its forced-refresh retry.
	pub fn retried(&self) -> bool {
		self.retried
	}
}

/// Transport instruction produced by a successful unauthorized notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDirective {
	/// Re-issue the original request exactly once.
	RetryOnce,
}

/// Network-facing refresh capability, implemented by the auth engine.
pub trait TokenRefresher
where
	Self: Send + Sync,
{
	/// Exchanges the refresh token for a fresh token set.
	fn refresh<'a>(&'a self, refresh_token: &'a str) -> ProviderFuture<'a, TokenSet>;
}

struct SharedFailure {
	round: u64,
	error: Error,
}

struct CredentialState {
	tokens: Arc<TokenSet>,
	/// Bumped on every installed token set; joiners use it to detect that a
	/// leader finished while they waited.
	generation: u64,
	/// Completed refresh round trips, success or failure. A caller that began
	/// waiting before round N completed shares round N's failure instead of
	/// issuing its own network call.
	refresh_rounds: u64,
	last_failure: Option<SharedFailure>,
	needs_reauth: bool,
}

/// Authentication credentials that allow making authorized API calls.
///
/// Owns the current [`TokenSet`], triggers refreshes through a single-flight
/// coordinator, and persists rotations to the attached store. One instance
/// serves one identity; share it across tasks behind an `Arc`.
pub struct Credentials {
	state: RwLock<CredentialState>,
	refresh_guard: AsyncMutex<()>,
	refresher: Arc<dyn TokenRefresher>,
	store: Option<Arc<dyn TokenStore>>,
	safety_margin: Duration,
	metrics: RefreshMetrics,
}
impl Credentials {
	/// Creates credentials around an existing token set.
	pub fn new(
		tokens: TokenSet,
		refresher: Arc<dyn TokenRefresher>,
		store: Option<Arc<dyn TokenStore>>,
	) -> Self {
		Self {
			state: RwLock::new(CredentialState {
				tokens: Arc::new(tokens),
				generation: 0,
				refresh_rounds: 0,
				last_failure: None,
				needs_reauth: false,
			}),
			refresh_guard: AsyncMutex::new(()),
			refresher,
			store,
			safety_margin: DEFAULT_SAFETY_MARGIN,
			metrics: RefreshMetrics::default(),
		}
	}

	/// Overrides the expiry safety margin (defaults to 60 seconds).
	pub fn with_safety_margin(mut self, margin: Duration) -> Self {
		self.safety_margin = if margin.is_negative() { Duration::ZERO } else { margin };

		self
	}

	/// Network refresh counters for this instance.
	pub fn metrics(&self) -> &RefreshMetrics {
		&self.metrics
	}

	/// Returns the current token set.
	pub fn current_tokens(&self) -> Arc<TokenSet> {
		self.state.read().tokens.clone()
	}

	/// Whether the provider has rejected this instance's refresh token.
	///
	/// Once set, no automatic refresh runs until [`install`](Self::install)
	/// supplies new credentials.
	pub fn needs_reauthentication(&self) -> bool {
		self.state.read().needs_reauth
	}

	/// Installs a replacement token set (typically a fresh login result),
	/// clearing any reauthentication mark and persisting the new set.
	pub async fn install(&self, tokens: TokenSet) -> Result<Arc<TokenSet>> {
		let _leader = self.refresh_guard.lock().await;
		let installed = Arc::new(tokens);

		{
			let mut state = self.state.write();

			state.tokens = installed.clone();
			state.generation += 1;
			state.last_failure = None;
			state.needs_reauth = false;
		}

		if let Some(store) = &self.store {
			store.save(&installed).await?;
		}

		Ok(installed)
	}

	/// Returns a token set valid for at least the safety margin.
	///
	/// At most one refresh round trip is in flight per instance; concurrent
	/// callers share the leader's outcome, success or failure.
	pub async fn ensure_fresh(&self) -> Result<Arc<TokenSet>> {
		{
			let state = self.state.read();

			if state.needs_reauth {
				return Err(Error::ReauthenticationRequired);
			}
			if state.tokens.is_fresh(self.safety_margin) {
				return Ok(state.tokens.clone());
			}
			if !state.tokens.is_refreshable() {
				return Err(Error::ExpiredCredentials);
			}
		}

		self.coordinated_refresh(false).await
	}

	/// Forces one coordinated refresh regardless of local expiry bookkeeping.
	///
	/// A refresh already in flight is joined rather than duplicated.
	pub async fn force_refresh(&self) -> Result<Arc<TokenSet>> {
		{
			let state = self.state.read();

			if state.needs_reauth {
				return Err(Error::ReauthenticationRequired);
			}
			if !state.tokens.is_refreshable() {
				return Err(Error::ExpiredCredentials);
			}
		}

		self.coordinated_refresh(true).await
	}

	async fn coordinated_refresh(&self, force: bool) -> Result<Arc<TokenSet>> {
		const KIND: FlowKind = FlowKind::Refresh;

		let (observed_generation, observed_rounds) = {
			let state = self.state.read();

			(state.generation, state.refresh_rounds)
		};
		let _leader = self.refresh_guard.lock().await;
		let refresh_secret = {
			let state = self.state.read();

			if state.needs_reauth {
				return Err(Error::ReauthenticationRequired);
			}
			// A leader finished while this caller waited for the guard.
			if state.generation != observed_generation {
				return Ok(state.tokens.clone());
			}
			if let Some(failure) = &state.last_failure
				&& failure.round > observed_rounds
			{
				return Err(clone_for_waiters(&failure.error));
			}
			if !force && state.tokens.is_fresh(self.safety_margin) {
				return Ok(state.tokens.clone());
			}

			state.tokens.refresh_token.clone().ok_or(Error::ExpiredCredentials)?
		};
		let span = FlowSpan::new(KIND, "refresh");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);
		self.metrics.record_attempt();

		let outcome = span.instrument(self.refresher.refresh(refresh_secret.expose())).await;

		match outcome {
			Ok(renewed) => {
				let renewed = Arc::new(keep_refresh_secret(renewed, refresh_secret));

				{
					let mut state = self.state.write();

					state.tokens = renewed.clone();
					state.generation += 1;
					state.refresh_rounds += 1;
					state.last_failure = None;
				}

				self.metrics.record_success();
				obs::record_flow_outcome(KIND, FlowOutcome::Success);

				// The in-memory swap comes first: the provider may have
				// rotated the refresh token, so a failed store write must not
				// discard the renewed set.
				if let Some(store) = &self.store {
					store.save(&renewed).await?;
				}

				Ok(renewed)
			},
			Err(err) => {
				{
					let mut state = self.state.write();

					if matches!(err, Error::ReauthenticationRequired) {
						state.needs_reauth = true;
					}

					state.refresh_rounds += 1;
					state.last_failure = Some(SharedFailure {
						round: state.refresh_rounds,
						error: clone_for_waiters(&err),
					});
				}

				self.metrics.record_failure();
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);

				Err(err)
			},
		}
	}

	fn bearer_request(tokens: &TokenSet, mut request: AuthRequest) -> Result<AuthRequest> {
		let value = HeaderValue::from_str(&format!("Bearer {}", tokens.access_token.expose()))
			.map_err(|e| ConfigError::HttpRequest(oauth2::http::Error::from(e)))?;

		request.headers_mut().insert(AUTHORIZATION, value);

		Ok(request)
	}
}
impl TokenProvider for Credentials {
	fn authorize(&self, request: AuthRequest) -> ProviderFuture<'_, AuthRequest> {
		Box::pin(async move {
			let tokens = self.ensure_fresh().await?;

			Self::bearer_request(&tokens, request)
		})
	}

	fn notify_unauthorized<'a>(
		&'a self,
		attempt: &'a mut RequestAttempt,
	) -> ProviderFuture<'a, RetryDirective> {
		Box::pin(async move {
			if attempt.retried {
				return Err(Error::Authorization);
			}

			self.force_refresh().await?;
			attempt.retried = true;

			Ok(RetryDirective::RetryOnce)
		})
	}
}
impl Debug for Credentials {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		let state = self.state.read();

		f.debug_struct("Credentials")
			.field("tokens", &state.tokens)
			.field("needs_reauth", &state.needs_reauth)
			.field("store_attached", &self.store.is_some())
			.field("safety_margin", &self.safety_margin)
			.finish()
	}
}

/// Providers that do not rotate omit the refresh token from the response; the
/// prior secret stays valid in that case.
fn keep_refresh_secret(mut renewed: TokenSet, prior: TokenSecret) -> TokenSet {
	if renewed.refresh_token.is_none() {
		renewed.refresh_token = Some(prior);
	}

	renewed
}

/// Clones a leader's failure for the callers that shared its round trip.
///
/// Terminal and endpoint classifications survive structurally; failures whose
/// sources cannot be cloned collapse into a retryable network error carrying
/// the leader's rendered message.
fn clone_for_waiters(error: &Error) -> Error {
	match error {
		Error::ReauthenticationRequired => Error::ReauthenticationRequired,
		Error::ExpiredCredentials => Error::ExpiredCredentials,
		Error::Authorization => Error::Authorization,
		Error::Authentication { reason } => Error::Authentication { reason: reason.clone() },
		Error::Otp { reason } => Error::Otp { reason: reason.clone() },
		Error::Network(NetworkError::Endpoint { endpoint, message, status }) =>
			NetworkError::Endpoint {
				endpoint: *endpoint,
				message: message.clone(),
				status: *status,
			}
			.into(),
		other => NetworkError::Endpoint {
			endpoint: "token",
			message: other.to_string(),
			status: None,
		}
		.into(),
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicU64, Ordering};
	// self
	use super::*;
	use crate::store::MemoryStore;

	const SLOW_REFRESH: std::time::Duration = std::time::Duration::from_millis(50);

	enum RefresherMode {
		Succeed,
		SucceedWithoutRotation,
		RejectRefreshToken,
		FailTransiently,
		FailOnceThenSucceed,
	}

	struct ScriptedRefresher {
		mode: RefresherMode,
		calls: AtomicU64,
	}
	impl ScriptedRefresher {
		fn new(mode: RefresherMode) -> Arc<Self> {
			Arc::new(Self { mode, calls: AtomicU64::new(0) })
		}

		fn calls(&self) -> u64 {
			self.calls.load(Ordering::SeqCst)
		}

		fn fresh_tokens(round: u64, rotate: bool) -> TokenSet {
			let mut builder = TokenSet::builder()
				.access_token(format!("renewed-access-{round}"))
				.issued_now()
				.expires_in(Duration::hours(1));

			if rotate {
				builder = builder.refresh_token(format!("renewed-refresh-{round}"));
			}

			builder.build().expect("Renewed token fixture should build.")
		}
	}
	impl TokenRefresher for ScriptedRefresher {
		fn refresh<'a>(&'a self, _refresh_token: &'a str) -> ProviderFuture<'a, TokenSet> {
			Box::pin(async move {
				let round = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

				// Hold the leader in flight long enough for joiners to queue.
				tokio::time::sleep(SLOW_REFRESH).await;

				match self.mode {
					RefresherMode::Succeed =>
						Ok(Self::fresh_tokens(round, true)),
					RefresherMode::SucceedWithoutRotation =>
						Ok(Self::fresh_tokens(round, false)),
					RefresherMode::RejectRefreshToken => Err(Error::ReauthenticationRequired),
					RefresherMode::FailTransiently => Err(NetworkError::Endpoint {
						endpoint: "token",
						message: "connection reset".into(),
						status: None,
					}
					.into()),
					RefresherMode::FailOnceThenSucceed =>
						if round == 1 {
							Err(NetworkError::Endpoint {
								endpoint: "token",
								message: "connection reset".into(),
								status: None,
							}
							.into())
						} else {
							Ok(Self::fresh_tokens(round, true))
						},
				}
			})
		}
	}

	fn expired_tokens(refreshable: bool) -> TokenSet {
		let issued = OffsetDateTime::now_utc() - Duration::hours(2);
		let mut builder = TokenSet::builder()
			.access_token("stale-access")
			.issued_at(issued)
			.expires_at(issued + Duration::hours(1));

		if refreshable {
			builder = builder.refresh_token("stale-refresh");
		}

		builder.build().expect("Expired token fixture should build.")
	}

	fn fresh_tokens() -> TokenSet {
		TokenSet::builder()
			.access_token("live-access")
			.refresh_token("live-refresh")
			.issued_now()
			.expires_in(Duration::hours(1))
			.build()
			.expect("Fresh token fixture should build.")
	}

	fn request() -> AuthRequest {
		oauth2::http::Request::builder()
			.method("GET")
			.uri("https://api.example.com/printers")
			.body(Vec::new())
			.expect("Request fixture should build.")
	}

	#[tokio::test]
	async fn fresh_tokens_authorize_without_any_network_call() {
		let refresher = ScriptedRefresher::new(RefresherMode::Succeed);
		let credentials = Credentials::new(fresh_tokens(), refresher.clone(), None);
		let authorized = credentials
			.authorize(request())
			.await
			.expect("Authorize should succeed with fresh tokens.");

		assert_eq!(
			authorized
				.headers()
				.get(AUTHORIZATION)
				.and_then(|value| value.to_str().ok()),
			Some("Bearer live-access"),
		);
		assert_eq!(refresher.calls(), 0);
		assert_eq!(credentials.metrics().attempts(), 0);
	}

	#[tokio::test]
	async fn concurrent_authorize_calls_share_one_refresh() {
		let refresher = ScriptedRefresher::new(RefresherMode::Succeed);
		let credentials = Arc::new(Credentials::new(expired_tokens(true), refresher.clone(), None));
		let tasks: Vec<_> = (0..8)
			.map(|_| {
				let credentials = credentials.clone();

				tokio::spawn(async move { credentials.ensure_fresh().await })
			})
			.collect();

		for task in tasks {
			let tokens = task
				.await
				.expect("Authorize task should not panic.")
				.expect("Shared refresh should succeed for every caller.");

			assert_eq!(tokens.access_token.expose(), "renewed-access-1");
		}

		assert_eq!(refresher.calls(), 1);
		assert_eq!(credentials.metrics().attempts(), 1);
		assert_eq!(credentials.metrics().successes(), 1);
	}

	#[tokio::test]
	async fn rejected_refresh_token_is_terminal_and_leaves_the_store_untouched() {
		let refresher = ScriptedRefresher::new(RefresherMode::RejectRefreshToken);
		let backend = MemoryStore::seeded(expired_tokens(true));
		let store: Arc<dyn TokenStore> = Arc::new(backend.clone());
		let credentials =
			Arc::new(Credentials::new(expired_tokens(true), refresher.clone(), Some(store)));
		let tasks: Vec<_> = (0..4)
			.map(|_| {
				let credentials = credentials.clone();

				tokio::spawn(async move { credentials.ensure_fresh().await })
			})
			.collect();

		for task in tasks {
			let result = task.await.expect("Refresh task should not panic.");

			assert!(matches!(result, Err(Error::ReauthenticationRequired)));
		}

		assert_eq!(refresher.calls(), 1, "Waiters must share the rejected round trip.");
		assert!(credentials.needs_reauthentication());
		assert_eq!(backend.saves(), 0, "A rejected refresh must not touch the store.");

		// No further network attempt happens until new credentials arrive.
		assert!(matches!(
			credentials.ensure_fresh().await,
			Err(Error::ReauthenticationRequired),
		));
		assert_eq!(refresher.calls(), 1);
	}

	#[tokio::test]
	async fn install_clears_the_reauthentication_mark() {
		let refresher = ScriptedRefresher::new(RefresherMode::RejectRefreshToken);
		let backend = MemoryStore::default();
		let store: Arc<dyn TokenStore> = Arc::new(backend.clone());
		let credentials = Credentials::new(expired_tokens(true), refresher.clone(), Some(store));

		assert!(matches!(
			credentials.ensure_fresh().await,
			Err(Error::ReauthenticationRequired),
		));
		assert!(credentials.needs_reauthentication());

		credentials
			.install(fresh_tokens())
			.await
			.expect("Installing replacement tokens should succeed.");

		assert!(!credentials.needs_reauthentication());
		assert_eq!(backend.saves(), 1);
		assert_eq!(
			credentials
				.ensure_fresh()
				.await
				.expect("Fresh install should authorize without refreshing.")
				.access_token
				.expose(),
			"live-access",
		);
		assert_eq!(refresher.calls(), 1);
	}

	#[tokio::test]
	async fn degraded_expired_tokens_fail_fast_without_network() {
		let refresher = ScriptedRefresher::new(RefresherMode::Succeed);
		let credentials = Credentials::new(expired_tokens(false), refresher.clone(), None);
		let result = credentials.authorize(request()).await;

		assert!(matches!(result, Err(Error::ExpiredCredentials)));
		assert_eq!(refresher.calls(), 0);
		assert_eq!(credentials.metrics().attempts(), 0);
	}

	#[tokio::test]
	async fn transient_failure_keeps_the_prior_tokens_and_allows_retry() {
		let refresher = ScriptedRefresher::new(RefresherMode::FailOnceThenSucceed);
		let credentials = Credentials::new(expired_tokens(true), refresher.clone(), None);
		let first = credentials.ensure_fresh().await;

		assert!(matches!(first, Err(Error::Network(_))));
		assert_eq!(credentials.current_tokens().access_token.expose(), "stale-access");
		assert!(!credentials.needs_reauthentication());

		let second = credentials
			.ensure_fresh()
			.await
			.expect("Retry after a transient failure should succeed.");

		assert_eq!(second.access_token.expose(), "renewed-access-2");
		assert_eq!(refresher.calls(), 2);
	}

	#[tokio::test]
	async fn concurrent_waiters_share_a_transient_failure() {
		let refresher = ScriptedRefresher::new(RefresherMode::FailTransiently);
		let credentials = Arc::new(Credentials::new(expired_tokens(true), refresher.clone(), None));
		let tasks: Vec<_> = (0..4)
			.map(|_| {
				let credentials = credentials.clone();

				tokio::spawn(async move { credentials.ensure_fresh().await })
			})
			.collect();

		for task in tasks {
			let result = task.await.expect("Refresh task should not panic.");

			assert!(matches!(result, Err(Error::Network(_))));
		}

		assert_eq!(refresher.calls(), 1, "Waiters must share the failed round trip.");
	}

	#[tokio::test]
	async fn refresh_without_rotation_keeps_the_prior_refresh_token() {
		let refresher = ScriptedRefresher::new(RefresherMode::SucceedWithoutRotation);
		let credentials = Credentials::new(expired_tokens(true), refresher.clone(), None);
		let renewed = credentials
			.ensure_fresh()
			.await
			.expect("Refresh without rotation should succeed.");

		assert_eq!(
			renewed.refresh_token.as_ref().map(|secret| secret.expose()),
			Some("stale-refresh"),
		);
	}

	#[tokio::test]
	async fn unauthorized_notification_forces_one_refresh_then_gives_up() {
		let refresher = ScriptedRefresher::new(RefresherMode::Succeed);
		let backend = MemoryStore::default();
		let store: Arc<dyn TokenStore> = Arc::new(backend.clone());
		let credentials = Credentials::new(fresh_tokens(), refresher.clone(), Some(store));
		let mut attempt = RequestAttempt::new();
		let directive = credentials
			.notify_unauthorized(&mut attempt)
			.await
			.expect("First unauthorized notification should force a refresh.");

		assert_eq!(directive, RetryDirective::RetryOnce);
		assert!(attempt.retried());
		assert_eq!(refresher.calls(), 1, "A locally fresh token must still be refreshed.");
		assert_eq!(backend.saves(), 1);

		let result = credentials.notify_unauthorized(&mut attempt).await;

		assert!(matches!(result, Err(Error::Authorization)));
		assert_eq!(refresher.calls(), 1, "The second rejection must not refresh again.");
	}

	#[tokio::test]
	async fn refresh_persists_the_rotated_set() {
		let refresher = ScriptedRefresher::new(RefresherMode::Succeed);
		let backend = MemoryStore::seeded(expired_tokens(true));
		let store: Arc<dyn TokenStore> = Arc::new(backend.clone());
		let credentials = Credentials::new(expired_tokens(true), refresher.clone(), Some(store));

		credentials.ensure_fresh().await.expect("Refresh should succeed.");

		let persisted = backend.snapshot().expect("Store should hold the rotated record.");

		assert_eq!(persisted.access_token.expose(), "renewed-access-1");
		assert_eq!(
			persisted.refresh_token.as_ref().map(|secret| secret.expose()),
			Some("renewed-refresh-1"),
		);
	}
}
