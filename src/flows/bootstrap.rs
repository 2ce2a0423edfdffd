//! Credential bootstrap precedence for client construction.
//!
//! The chain runs once when the surrounding client is built and yields one
//! [`Credentials`] value, or nothing. First match wins:
//!
//! 1. An explicit credentials object supplied by the caller (which simply
//!    skips this chain).
//! 2. A raw bearer token from the environment — degraded, non-refreshable.
//! 3. A full token-JSON document from the environment.
//! 4. The on-disk record left by a prior interactive login.
//! 5. Absent — the caller is unauthenticated.
//!
//! Environment-sourced credentials are memory-only: refreshing them never
//! touches the on-disk record a prior interactive login left behind. A
//! candidate that cannot be decoded is skipped with a warning and the chain
//! moves on.

// std
use std::env;
// self
use crate::{
	_prelude::*,
	credentials::Credentials,
	flows::AuthEngine,
	http::TokenHttpClient,
	oauth::TransportErrorMapper,
	store::TokenStore,
	token::{TokenSet, claims},
};

/// Environment variable holding a raw bearer token (degraded, non-refreshable).
pub const ACCESS_TOKEN_ENV: &str = "CONNECT_ACCESS_TOKEN";
/// Environment variable holding a full token-set JSON document.
pub const TOKEN_JSON_ENV: &str = "CONNECT_TOKENS_JSON";
/// Environment variable holding the account identity for non-interactive login.
pub const IDENTITY_ENV: &str = "CONNECT_IDENTITY";
/// Environment variable holding the account secret for non-interactive login.
pub const SECRET_ENV: &str = "CONNECT_SECRET";

/// Identity/secret pair for a non-interactive login attempt, when both are set.
///
/// This pair is not part of the bootstrap precedence chain: a login is a
/// remote conversation the caller triggers explicitly, typically via
/// [`AuthEngine::login_noninteractive`](crate::flows::AuthEngine::login_noninteractive).
pub fn login_pair_from_env() -> Option<(String, String)> {
	let identity = env::var(IDENTITY_ENV).ok().filter(|value| !value.is_empty())?;
	let secret = env::var(SECRET_ENV).ok().filter(|value| !value.is_empty())?;

	Some((identity, secret))
}

/// Snapshot of the environment-provided credential sources.
///
/// Bootstrap consumes a snapshot instead of reading the process environment
/// directly, which keeps the precedence chain deterministic and testable.
#[derive(Clone, Debug, Default)]
pub struct BootstrapSources {
	/// Raw bearer token (degraded mode).
	pub bearer_token: Option<String>,
	/// Full token-set JSON document.
	pub token_json: Option<String>,
}
impl BootstrapSources {
	/// Captures [`ACCESS_TOKEN_ENV`] and [`TOKEN_JSON_ENV`] from the process
	/// environment.
	pub fn from_env() -> Self {
		Self {
			bearer_token: env::var(ACCESS_TOKEN_ENV).ok().filter(|value| !value.is_empty()),
			token_json: env::var(TOKEN_JSON_ENV).ok().filter(|value| !value.is_empty()),
		}
	}
}

/// Wire shape of the token-JSON environment document.
#[derive(Debug, Deserialize)]
struct EnvTokenDocument {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default, alias = "id_token")]
	identity_token: Option<String>,
	#[serde(default, with = "time::serde::timestamp::option")]
	expires_at: Option<OffsetDateTime>,
	#[serde(default)]
	scope: Option<String>,
}

impl<C, M> AuthEngine<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Runs the bootstrap precedence chain and builds credentials for the
	/// first usable source.
	///
	/// Returns `Ok(None)` when every source is absent; the caller is then
	/// unauthenticated until an interactive login runs.
	pub async fn bootstrap_credentials(
		&self,
		sources: BootstrapSources,
		store: Option<Arc<dyn TokenStore>>,
	) -> Result<Option<Credentials>> {
		if let Some(raw) = &sources.bearer_token {
			match token_set_from_bearer(raw) {
				Some(tokens) => return Ok(Some(self.credentials_from(tokens, None))),
				None => skip_source(ACCESS_TOKEN_ENV),
			}
		}
		if let Some(document) = &sources.token_json {
			match token_set_from_document(document) {
				Some(tokens) => return Ok(Some(self.credentials_from(tokens, None))),
				None => skip_source(TOKEN_JSON_ENV),
			}
		}
		if let Some(store) = store
			&& let Some(tokens) = store.load().await?
		{
			return Ok(Some(self.credentials_from(tokens, Some(store))));
		}

		Ok(None)
	}
}

fn skip_source(source: &'static str) {
	#[cfg(feature = "tracing")]
	tracing::warn!(source, "Ignoring environment credentials that could not be decoded.");
	#[cfg(not(feature = "tracing"))]
	let _ = source;
}

/// Expiry bookkeeping for out-of-band bearer tokens comes from their own
/// `iat`/`exp` claims; a token without a decodable expiry is unusable.
fn token_set_from_bearer(raw: &str) -> Option<TokenSet> {
	let bearer_claims = claims::peek_bearer_claims(raw)?;
	let mut builder =
		TokenSet::builder().access_token(raw).expires_at(bearer_claims.expires_at?);

	if let Some(issued_at) = bearer_claims.issued_at {
		builder = builder.issued_at(issued_at);
	}

	builder.build().ok()
}

fn token_set_from_document(document: &str) -> Option<TokenSet> {
	let doc: EnvTokenDocument = serde_json::from_str(document).ok()?;
	let bearer_claims = claims::peek_bearer_claims(&doc.access_token);
	let expires_at =
		doc.expires_at.or_else(|| bearer_claims.and_then(|claims| claims.expires_at))?;
	let mut builder = TokenSet::builder().access_token(doc.access_token).expires_at(expires_at);

	if let Some(issued_at) = bearer_claims.and_then(|claims| claims.issued_at) {
		builder = builder.issued_at(issued_at);
	}
	if let Some(refresh) = doc.refresh_token {
		builder = builder.refresh_token(refresh);
	}
	if let Some(identity) = doc.identity_token {
		builder = builder.identity_token(identity);
	}
	if let Some(scope) = doc.scope {
		builder = builder.scope(scope);
	}

	builder.build().ok()
}
