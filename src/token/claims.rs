//! Non-validating peeks into JWT claim payloads.
//!
//! Tokens supplied out-of-band (environment variables, pasted bearer strings)
//! arrive without the provider's `expires_in` bookkeeping. Their payload still
//! carries `iat`/`exp` claims, which is enough to schedule refreshes. Nothing
//! here verifies a signature; these values are never used for authorization
//! decisions.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
// self
use crate::_prelude::*;

/// Expiry bookkeeping recovered from a raw JWT payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BearerClaims {
	/// `iat` claim, when present.
	pub issued_at: Option<OffsetDateTime>,
	/// `exp` claim, when present.
	pub expires_at: Option<OffsetDateTime>,
}

/// Decodes the payload segment of a JWT without any signature validation.
///
/// Returns `None` when the value is not a decodable three-segment token.
pub fn peek_bearer_claims(raw: &str) -> Option<BearerClaims> {
	let mut segments = raw.split('.');
	let payload = segments.nth(1)?;

	if segments.next().is_none() {
		return None;
	}

	let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
	let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
	let instant = |key: &str| {
		value
			.get(key)
			.and_then(serde_json::Value::as_i64)
			.and_then(|timestamp| OffsetDateTime::from_unix_timestamp(timestamp).ok())
	};

	Some(BearerClaims { issued_at: instant("iat"), expires_at: instant("exp") })
}
