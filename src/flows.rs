//! High-level flow orchestrators built around [`AuthEngine`].

pub mod bootstrap;
pub mod login;

mod pkce;

pub use bootstrap::*;
pub use login::*;

// self
use crate::{
	_prelude::*,
	credentials::{Credentials, ProviderFuture, TokenRefresher},
	http::TokenHttpClient,
	oauth::{TokenEndpointFacade, TransportErrorMapper},
	provider::ProviderDescriptor,
	store::TokenStore,
	token::TokenSet,
};
#[cfg(feature = "reqwest")]
use crate::{http::ReqwestHttpClient, oauth::ReqwestTransportErrorMapper};

#[cfg(feature = "reqwest")]
/// Engine specialized for the crate's default reqwest transport stack.
pub type ReqwestAuthEngine = AuthEngine<ReqwestHttpClient, ReqwestTransportErrorMapper>;

/// Drives the login and refresh conversations with one identity provider.
///
/// The engine owns the HTTP client, provider descriptor, and transport error
/// mapper so the flow implementations can focus on protocol logic (PKCE
/// generation, challenge rounds, exchanges). Clones are cheap and share the
/// underlying transport; [`Credentials`] built by the engine hold a clone as
/// their refresh capability.
pub struct AuthEngine<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// HTTP client wrapper used for every outbound provider request.
	pub http_client: Arc<C>,
	/// Mapper applied to transport-layer errors before surfacing them to callers.
	pub transport_mapper: Arc<M>,
	/// Provider descriptor that defines endpoints and client identity.
	pub provider: ProviderDescriptor,
}
impl<C, M> AuthEngine<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates an engine that reuses the caller-provided transport + mapper pair.
	pub fn with_http_client(
		provider: ProviderDescriptor,
		http_client: impl Into<Arc<C>>,
		mapper: impl Into<Arc<M>>,
	) -> Self {
		Self { http_client: http_client.into(), transport_mapper: mapper.into(), provider }
	}

	/// Wraps an existing token set (e.g. a fresh login result) into credentials.
	///
	/// Environment-sourced and freshly imported token sets typically pass no
	/// store; records loaded from disk pass the store they came from so
	/// refreshes persist rotations.
	pub fn credentials_from(
		&self,
		tokens: TokenSet,
		store: Option<Arc<dyn TokenStore>>,
	) -> Credentials {
		Credentials::new(tokens, Arc::new(self.clone()), store)
	}

	pub(crate) fn facade(&self) -> Result<TokenEndpointFacade<C, M>> {
		TokenEndpointFacade::from_provider(
			&self.provider,
			self.http_client.clone(),
			self.transport_mapper.clone(),
		)
	}
}
#[cfg(feature = "reqwest")]
impl AuthEngine<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates a new engine for the provided descriptor.
	///
	/// The engine provisions its own reqwest-backed transport so callers do not
	/// need to pass HTTP handles explicitly. Use
	/// [`AuthEngine::with_http_client`] to supply a transport with a custom
	/// timeout or TLS configuration.
	pub fn new(provider: ProviderDescriptor) -> Self {
		Self::with_http_client(
			provider,
			ReqwestHttpClient::default(),
			Arc::new(ReqwestTransportErrorMapper),
		)
	}
}
impl<C, M> Clone for AuthEngine<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn clone(&self) -> Self {
		Self {
			http_client: self.http_client.clone(),
			transport_mapper: self.transport_mapper.clone(),
			provider: self.provider.clone(),
		}
	}
}
impl<C, M> TokenRefresher for AuthEngine<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn refresh<'a>(&'a self, refresh_token: &'a str) -> ProviderFuture<'a, TokenSet> {
		Box::pin(async move {
			let facade = self.facade()?;

			facade.refresh(refresh_token).await
		})
	}
}
impl<C, M> Debug for AuthEngine<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AuthEngine").field("provider", &self.provider).finish()
	}
}
