//! Immutable token set model, redacted secrets, and expiry bookkeeping.

pub mod claims;

// self
use crate::_prelude::*;

/// Redacted secret wrapper keeping token material out of logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSecret(String);
impl TokenSecret {
	/// Wraps a new secret string.
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the inner token value. Callers must avoid logging this string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}
impl AsRef<str> for TokenSecret {
	fn as_ref(&self) -> &str {
		self.expose()
	}
}
impl Debug for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("TokenSecret").field(&"<redacted>").finish()
	}
}
impl Display for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}

/// Errors produced by [`TokenSetBuilder`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum TokenSetBuilderError {
	/// Issued when no access token value was provided.
	#[error("Access token is required.")]
	MissingAccessToken,
	/// Issued when no expiry (absolute or relative) was configured.
	#[error("Expiry must be supplied via expires_at or expires_in.")]
	MissingExpiry,
	/// Issued when the expiry instant does not come after the issued instant.
	#[error("The expires_at instant must come after issued_at.")]
	ExpiryNotAfterIssue,
}

/// Immutable set of issued tokens together with its expiry bookkeeping.
///
/// A token set is a value: replacing it never mutates an existing instance.
/// [`Credentials`](crate::credentials::Credentials) swaps whole sets atomically.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
	/// Access token presented on each API request.
	pub access_token: TokenSecret,
	/// Refresh token, when the provider issued one; absent in degraded mode.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub refresh_token: Option<TokenSecret>,
	/// Identity token, when the provider issued one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub identity_token: Option<TokenSecret>,
	/// Issued-at instant recorded when the set was minted.
	#[serde(default = "unix_epoch", with = "time::serde::timestamp")]
	pub issued_at: OffsetDateTime,
	/// Expiry instant derived from the provider's reported lifetime.
	#[serde(with = "time::serde::timestamp")]
	pub expires_at: OffsetDateTime,
	/// Granted scope as reported by the provider.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub scope: Option<String>,
}
impl TokenSet {
	/// Returns a builder for assembling a validated token set.
	pub fn builder() -> TokenSetBuilder {
		TokenSetBuilder::new()
	}

	/// Whether the set stays valid for at least `margin` beyond the given instant.
	pub fn is_fresh_at(&self, instant: OffsetDateTime, margin: Duration) -> bool {
		self.expires_at - instant > margin
	}

	/// Convenience helper that checks freshness against the current UTC instant.
	pub fn is_fresh(&self, margin: Duration) -> bool {
		self.is_fresh_at(OffsetDateTime::now_utc(), margin)
	}

	/// Whether a refresh path exists for this set.
	pub fn is_refreshable(&self) -> bool {
		self.refresh_token.is_some()
	}
}
impl Debug for TokenSet {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenSet")
			.field("access_token", &"<redacted>")
			.field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
			.field("identity_token", &self.identity_token.as_ref().map(|_| "<redacted>"))
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.field("scope", &self.scope)
			.finish()
	}
}

fn unix_epoch() -> OffsetDateTime {
	OffsetDateTime::UNIX_EPOCH
}

fn truncate(instant: OffsetDateTime) -> OffsetDateTime {
	instant.replace_nanosecond(0).unwrap_or(instant)
}

/// Builder for [`TokenSet`].
#[derive(Clone, Debug, Default)]
pub struct TokenSetBuilder {
	access_token: Option<TokenSecret>,
	refresh_token: Option<TokenSecret>,
	identity_token: Option<TokenSecret>,
	issued_at: Option<OffsetDateTime>,
	expires_at: Option<OffsetDateTime>,
	expires_in: Option<Duration>,
	scope: Option<String>,
}
impl TokenSetBuilder {
	fn new() -> Self {
		Self::default()
	}

	/// Provides the access token value.
	pub fn access_token(mut self, token: impl Into<String>) -> Self {
		self.access_token = Some(TokenSecret::new(token));

		self
	}

	/// Provides the refresh token value.
	pub fn refresh_token(mut self, token: impl Into<String>) -> Self {
		self.refresh_token = Some(TokenSecret::new(token));

		self
	}

	/// Provides the identity token value.
	pub fn identity_token(mut self, token: impl Into<String>) -> Self {
		self.identity_token = Some(TokenSecret::new(token));

		self
	}

	/// Sets the issued-at instant.
	pub fn issued_at(mut self, instant: OffsetDateTime) -> Self {
		self.issued_at = Some(instant);

		self
	}

	/// Convenience helper that stamps `issued_at` with the current clock.
	pub fn issued_now(self) -> Self {
		self.issued_at(OffsetDateTime::now_utc())
	}

	/// Sets an absolute expiry instant.
	pub fn expires_at(mut self, instant: OffsetDateTime) -> Self {
		self.expires_at = Some(instant);

		self
	}

	/// Sets a relative expiry duration from the issued instant.
	pub fn expires_in(mut self, duration: Duration) -> Self {
		self.expires_in = Some(duration);

		self
	}

	/// Records the granted scope string.
	pub fn scope(mut self, scope: impl Into<String>) -> Self {
		self.scope = Some(scope.into());

		self
	}

	/// Consumes the builder and produces a [`TokenSet`].
	///
	/// Instants are truncated to whole seconds, the precision of the persisted
	/// record, so a stored and reloaded set compares equal to the original.
	pub fn build(self) -> Result<TokenSet, TokenSetBuilderError> {
		let access_token = self
			.access_token
			.filter(|token| !token.expose().is_empty())
			.ok_or(TokenSetBuilderError::MissingAccessToken)?;
		let issued_at = truncate(self.issued_at.unwrap_or_else(OffsetDateTime::now_utc));
		let expires_at = truncate(match (self.expires_at, self.expires_in) {
			(Some(instant), _) => instant,
			(None, Some(delta)) => issued_at + delta,
			(None, None) => return Err(TokenSetBuilderError::MissingExpiry),
		});

		if expires_at <= issued_at {
			return Err(TokenSetBuilderError::ExpiryNotAfterIssue);
		}

		Ok(TokenSet {
			access_token,
			refresh_token: self.refresh_token,
			identity_token: self.identity_token,
			issued_at,
			expires_at,
			scope: self.scope,
		})
	}
}
