//! Internal facade over the `oauth2` crate for token-endpoint exchanges.

pub use oauth2;

// std
use std::borrow::Cow;
// crates.io
use oauth2::{
	AuthType, AuthUrl, AuthorizationCode, Client, ClientId, EndpointNotSet, EndpointSet,
	ExtraTokenFields, HttpClientError, PkceCodeVerifier, RedirectUrl, RefreshToken,
	RequestTokenError, StandardRevocableToken, StandardTokenResponse, TokenResponse, TokenUrl,
	basic::{
		BasicErrorResponse, BasicErrorResponseType, BasicRequestTokenError,
		BasicRevocationErrorResponse, BasicTokenIntrospectionResponse, BasicTokenType,
	},
};
// self
use crate::{
	_prelude::*,
	error::{ConfigError, NetworkError},
	http::{ResponseMetadata, ResponseMetadataSlot, TokenHttpClient},
	provider::ProviderDescriptor,
	token::TokenSet,
};

const TOKEN_ENDPOINT: &str = "token";

/// Grant being executed; drives how provider error responses are classified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GrantKind {
	/// Initial authorization-code-plus-verifier exchange.
	AuthorizationCode,
	/// Subsequent refresh-token exchange.
	Refresh,
}

/// Token endpoint fields beyond the RFC 6749 core response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityTokenFields {
	/// Identity token issued alongside the access token, when present.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id_token: Option<String>,
}
impl ExtraTokenFields for IdentityTokenFields {}

pub(crate) type FacadeTokenResponse = StandardTokenResponse<IdentityTokenFields, BasicTokenType>;
type UnconfiguredClient = Client<
	BasicErrorResponse,
	FacadeTokenResponse,
	BasicTokenIntrospectionResponse,
	StandardRevocableToken,
	BasicRevocationErrorResponse,
	EndpointNotSet,
	EndpointNotSet,
	EndpointNotSet,
	EndpointNotSet,
	EndpointNotSet,
>;
type ConfiguredClient = Client<
	BasicErrorResponse,
	FacadeTokenResponse,
	BasicTokenIntrospectionResponse,
	StandardRevocableToken,
	BasicRevocationErrorResponse,
	EndpointSet,
	EndpointNotSet,
	EndpointNotSet,
	EndpointNotSet,
	EndpointSet,
>;
type FacadeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a + Send>>;

/// Maps HTTP transport failures into engine [`Error`] values.
pub trait TransportErrorMapper<E>
where
	Self: 'static + Send + Sync,
	E: 'static + Send + Sync + StdError,
{
	/// Converts an [`HttpClientError`] emitted by the transport into an engine error.
	fn map_transport_error(
		&self,
		endpoint: &'static str,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<E>,
	) -> Error;
}

/// Default mapper for reqwest-backed transports.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransportErrorMapper;
#[cfg(feature = "reqwest")]
impl TransportErrorMapper<ReqwestError> for ReqwestTransportErrorMapper {
	fn map_transport_error(
		&self,
		endpoint: &'static str,
		meta: Option<&ResponseMetadata>,
		err: HttpClientError<ReqwestError>,
	) -> Error {
		match err {
			HttpClientError::Reqwest(inner) => map_reqwest_error(endpoint, meta, *inner),
			HttpClientError::Http(inner) => ConfigError::from(inner).into(),
			HttpClientError::Io(inner) => NetworkError::Io(inner).into(),
			HttpClientError::Other(message) => NetworkError::Endpoint {
				endpoint,
				message: format!("HTTP client error occurred: {message}"),
				status: meta_status(meta),
			}
			.into(),
			_ => NetworkError::Endpoint {
				endpoint,
				message: "HTTP client error occurred".into(),
				status: meta_status(meta),
			}
			.into(),
		}
	}
}

/// Configured OAuth client plus the transport pair needed to drive exchanges.
pub(crate) struct TokenEndpointFacade<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	oauth_client: ConfiguredClient,
	http_client: Arc<C>,
	error_mapper: Arc<M>,
}
impl<C, M> TokenEndpointFacade<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	pub(crate) fn from_provider(
		provider: &ProviderDescriptor,
		http_client: Arc<C>,
		error_mapper: Arc<M>,
	) -> Result<Self> {
		let auth_url = AuthUrl::new(provider.endpoints.authorization.to_string())
			.map_err(|source| ConfigError::InvalidEndpoint { source })?;
		let token_url = TokenUrl::new(provider.endpoints.token.to_string())
			.map_err(|source| ConfigError::InvalidEndpoint { source })?;
		// Public client: the identifier travels in the form body, never in a
		// Basic authorization header.
		let oauth_client = UnconfiguredClient::new(ClientId::new(provider.client_id.clone()))
			.set_auth_uri(auth_url)
			.set_token_uri(token_url)
			.set_auth_type(AuthType::RequestBody);

		Ok(Self { oauth_client, http_client, error_mapper })
	}

	/// Exchanges an authorization code plus the original PKCE verifier for tokens.
	pub(crate) fn exchange_authorization_code<'a>(
		&'a self,
		code: &'a str,
		verifier: &'a str,
		redirect_uri: &'a Url,
	) -> FacadeFuture<'a, TokenSet> {
		let meta = ResponseMetadataSlot::default();

		Box::pin(async move {
			let instrumented = self.http_client.with_metadata(meta.clone());
			let redirect_url = RedirectUrl::new(redirect_uri.to_string())
				.map_err(|source| ConfigError::InvalidRedirect { source })?;
			let request = self
				.oauth_client
				.exchange_code(AuthorizationCode::new(code.to_owned()))
				.set_pkce_verifier(PkceCodeVerifier::new(verifier.to_owned()))
				.set_redirect_uri(Cow::Owned(redirect_url));
			let response = request.request_async(&instrumented).await.map_err(|err| {
				map_request_error(
					GrantKind::AuthorizationCode,
					meta.take(),
					err,
					self.error_mapper.as_ref(),
				)
			})?;

			token_set_from_response(response)
		})
	}

	/// Exchanges a refresh token for a fresh token set.
	pub(crate) fn refresh<'a>(&'a self, refresh_token: &'a str) -> FacadeFuture<'a, TokenSet> {
		let meta = ResponseMetadataSlot::default();

		Box::pin(async move {
			let instrumented = self.http_client.with_metadata(meta.clone());
			let refresh_secret = RefreshToken::new(refresh_token.to_owned());
			let request = self.oauth_client.exchange_refresh_token(&refresh_secret);
			let response = request.request_async(&instrumented).await.map_err(|err| {
				map_request_error(GrantKind::Refresh, meta.take(), err, self.error_mapper.as_ref())
			})?;

			token_set_from_response(response)
		})
	}
}

pub(crate) fn token_set_from_response(response: FacadeTokenResponse) -> Result<TokenSet> {
	let expires_in = response.expires_in().ok_or(ConfigError::MissingExpiresIn)?.as_secs();
	let expires_in = i64::try_from(expires_in).map_err(|_| ConfigError::ExpiresInOutOfRange)?;

	if expires_in <= 0 {
		return Err(ConfigError::NonPositiveExpiresIn.into());
	}

	let mut builder = TokenSet::builder()
		.access_token(response.access_token().secret().to_owned())
		.issued_now()
		.expires_in(Duration::seconds(expires_in));

	if let Some(refresh) = response.refresh_token() {
		builder = builder.refresh_token(refresh.secret().to_owned());
	}
	if let Some(identity) = &response.extra_fields().id_token {
		builder = builder.identity_token(identity.clone());
	}
	if let Some(scopes) = response.scopes() {
		let scope =
			scopes.iter().map(|scope| scope.as_str()).collect::<Vec<_>>().join(" ");

		if !scope.is_empty() {
			builder = builder.scope(scope);
		}
	}

	builder.build().map_err(|err| ConfigError::from(err).into())
}

fn map_request_error<E, M>(
	grant: GrantKind,
	meta: Option<ResponseMetadata>,
	err: BasicRequestTokenError<HttpClientError<E>>,
	mapper: &M,
) -> Error
where
	E: 'static + Send + Sync + StdError,
	M: ?Sized + TransportErrorMapper<E>,
{
	let meta_ref = meta.as_ref();

	match err {
		RequestTokenError::ServerResponse(response) =>
			map_server_response_error(grant, response, meta_ref),
		RequestTokenError::Request(error) =>
			mapper.map_transport_error(TOKEN_ENDPOINT, meta_ref, error),
		RequestTokenError::Parse(error, _body) => NetworkError::ResponseParse {
			endpoint: TOKEN_ENDPOINT,
			source: error,
			status: meta_status(meta_ref),
		}
		.into(),
		RequestTokenError::Other(message) => NetworkError::Endpoint {
			endpoint: TOKEN_ENDPOINT,
			message,
			status: meta_status(meta_ref),
		}
		.into(),
	}
}

fn map_server_response_error(
	grant: GrantKind,
	response: BasicErrorResponse,
	meta: Option<&ResponseMetadata>,
) -> Error {
	let message = if let Some(description) = response.error_description() {
		format!("Token endpoint returned an OAuth error: {description}")
	} else {
		format!("Token endpoint returned an OAuth error: {}", response.error().as_ref())
	};

	match response.error() {
		// A rejected refresh token is terminal for the credentials instance;
		// a rejected authorization code just fails the login attempt.
		BasicErrorResponseType::InvalidGrant => match grant {
			GrantKind::Refresh => Error::ReauthenticationRequired,
			GrantKind::AuthorizationCode => Error::Authentication { reason: message },
		},
		BasicErrorResponseType::InvalidClient | BasicErrorResponseType::UnauthorizedClient =>
			Error::Authentication { reason: message },
		_ => NetworkError::Endpoint {
			endpoint: TOKEN_ENDPOINT,
			message,
			status: meta_status(meta),
		}
		.into(),
	}
}

#[cfg(feature = "reqwest")]
fn map_reqwest_error(
	endpoint: &'static str,
	meta: Option<&ResponseMetadata>,
	err: ReqwestError,
) -> Error {
	if err.is_builder() {
		return ConfigError::from(err).into();
	}
	if err.is_timeout() {
		return NetworkError::Endpoint {
			endpoint,
			message: "Request timed out".into(),
			status: meta_status(meta).or_else(|| err.status().map(|code| code.as_u16())),
		}
		.into();
	}

	NetworkError::transport(endpoint, err).into()
}

fn meta_status(meta: Option<&ResponseMetadata>) -> Option<u16> {
	meta.and_then(|value| value.status)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::token::TokenSecret;

	fn provider() -> ProviderDescriptor {
		ProviderDescriptor::builder()
			.authorization_endpoint(
				Url::parse("https://id.example.com/authorize")
					.expect("Failed to parse authorization endpoint URL."),
			)
			.token_endpoint(
				Url::parse("https://id.example.com/token")
					.expect("Failed to parse token endpoint URL."),
			)
			.client_id("public-client")
			.redirect_uri(
				Url::parse("https://app.example.com/callback")
					.expect("Failed to parse redirect URI."),
			)
			.build()
			.expect("Failed to build provider descriptor.")
	}

	#[cfg(feature = "reqwest")]
	#[test]
	fn builds_facade_for_public_client() {
		use crate::http::ReqwestHttpClient;

		let result = <TokenEndpointFacade<ReqwestHttpClient, ReqwestTransportErrorMapper>>::from_provider(
			&provider(),
			Arc::new(ReqwestHttpClient::default()),
			Arc::new(ReqwestTransportErrorMapper),
		);

		assert!(result.is_ok());
	}

	#[test]
	fn token_response_maps_into_a_full_token_set() {
		let response: FacadeTokenResponse = serde_json::from_str(
			"{\"access_token\":\"access-1\",\"token_type\":\"bearer\",\"expires_in\":3600,\
			 \"refresh_token\":\"refresh-1\",\"id_token\":\"identity-1\",\"scope\":\"basic_info\"}",
		)
		.expect("Token response fixture should deserialize.");
		let tokens = token_set_from_response(response)
			.expect("Token response should map into a token set.");

		assert_eq!(tokens.access_token.expose(), "access-1");
		assert_eq!(tokens.refresh_token.as_ref().map(TokenSecret::expose), Some("refresh-1"));
		assert_eq!(tokens.identity_token.as_ref().map(TokenSecret::expose), Some("identity-1"));
		assert_eq!(tokens.scope.as_deref(), Some("basic_info"));
		assert!(tokens.expires_at > tokens.issued_at);
	}

	#[test]
	fn token_response_without_expires_in_is_rejected() {
		let response: FacadeTokenResponse = serde_json::from_str(
			"{\"access_token\":\"access-1\",\"token_type\":\"bearer\"}",
		)
		.expect("Token response fixture should deserialize.");
		let result = token_set_from_response(response);

		assert!(matches!(result, Err(Error::Config(ConfigError::MissingExpiresIn))));
	}
}
