//! Credential lifecycle and request authorization engine for the Connect device cloud—PKCE
//! login, durable token storage, and single-flight refresh behind one bearer-injection contract.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod credentials;
pub mod error;
pub mod flows;
pub mod http;
pub mod oauth;
pub mod obs;
pub mod provider;
pub mod store;
pub mod token;
#[cfg(all(any(test, feature = "test"), feature = "reqwest"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// self
	use crate::{
		flows::{AuthEngine, ReqwestAuthEngine},
		provider::ProviderDescriptor,
	};

	/// Builds a provider descriptor pointing at a mock server's base URL.
	///
	/// The authorization endpoint lives at `/authorize` and the token endpoint
	/// at `/token`, matching the paths the integration tests mock out.
	pub fn test_provider(base_url: &str) -> ProviderDescriptor {
		let authorization = Url::parse(&format!("{base_url}/authorize"))
			.expect("Mock authorization endpoint should parse successfully.");
		let token = Url::parse(&format!("{base_url}/token"))
			.expect("Mock token endpoint should parse successfully.");
		let redirect = Url::parse("http://127.0.0.1/auth-callback")
			.expect("Mock redirect URI should parse successfully.");

		ProviderDescriptor::builder()
			.authorization_endpoint(authorization)
			.token_endpoint(token)
			.client_id("client-test")
			.redirect_uri(redirect)
			.build()
			.expect("Mock provider descriptor should build successfully.")
	}

	/// Constructs an [`AuthEngine`] wired to the crate's default reqwest transport.
	pub fn build_reqwest_test_engine(provider: ProviderDescriptor) -> ReqwestAuthEngine {
		AuthEngine::new(provider)
	}
}

mod _prelude {
	pub use std::{
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(test)] use {color_eyre as _, connect_auth as _, httpmock as _};
