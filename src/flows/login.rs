//! Interactive authorization-code-with-PKCE login, including multi-factor
//! challenge rounds.
//!
//! One call to [`AuthEngine::login`] is one attempt: the engine generates a
//! PKCE pair, submits the identity and secret together with the challenge,
//! works through any one-time-code rounds the provider demands, and exchanges
//! the resulting authorization code plus the original verifier for tokens. An
//! attempt holds no resumable state; a transport failure means starting over.

// crates.io
use oauth2::{
	AsyncHttpClient, HttpResponse,
	http::{
		Request, StatusCode,
		header::{ACCEPT, CONTENT_TYPE},
	},
};
use url::form_urlencoded;
// self
use crate::{
	_prelude::*,
	error::{ConfigError, NetworkError},
	flows::{AuthEngine, pkce::{self, PkcePair}},
	http::{ResponseMetadataSlot, TokenHttpClient},
	oauth::TransportErrorMapper,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	token::TokenSet,
};

const AUTHORIZATION_ENDPOINT: &str = "authorization";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const OTP_CHALLENGE: &str = "otp";

/// Supplies one-time codes for multi-factor challenge rounds.
///
/// The handler is consulted once per round. `rejected` counts the codes the
/// provider has already refused during this attempt, so an interactive
/// implementation can tell the user their previous entry was wrong. Returning
/// `None` abandons the challenge and the login surfaces the provider's
/// rejection.
pub trait OtpHandler {
	/// Returns the next one-time code, or `None` to abandon the challenge.
	fn one_time_code(&mut self, rejected: u32) -> Option<String>;
}
impl<F> OtpHandler for F
where
	F: FnMut(u32) -> Option<String>,
{
	fn one_time_code(&mut self, rejected: u32) -> Option<String> {
		self(rejected)
	}
}

/// Stages of the login conversation, used to tag flow spans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginStage {
	/// Attempt created; nothing sent yet.
	Init,
	/// PKCE verifier and challenge generated.
	ChallengeBuilt,
	/// Identity and secret submitted to the authorization endpoint.
	CredentialsSubmitted,
	/// Provider demanded a one-time code.
	OtpRequired,
	/// Authorization code exchanged at the token endpoint.
	TokenExchanged,
	/// Token set assembled; the attempt finished.
	Complete,
	/// Attempt aborted by an error.
	Failed,
}
impl LoginStage {
	/// Returns a stable label suitable for span fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			LoginStage::Init => "init",
			LoginStage::ChallengeBuilt => "challenge_built",
			LoginStage::CredentialsSubmitted => "credentials_submitted",
			LoginStage::OtpRequired => "otp_required",
			LoginStage::TokenExchanged => "token_exchanged",
			LoginStage::Complete => "complete",
			LoginStage::Failed => "failed",
		}
	}
}
impl Display for LoginStage {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

#[derive(Debug)]
enum AuthorizeOutcome {
	/// Authorization code ready for the token exchange.
	Code(String),
	/// Provider demands a one-time code for the given challenge session.
	OtpChallenge(String),
}

#[derive(Debug, Deserialize)]
struct AuthorizeReply {
	#[serde(default)]
	code: Option<String>,
	#[serde(default)]
	challenge: Option<String>,
	#[serde(default)]
	challenge_session: Option<String>,
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	error_description: Option<String>,
}

impl<C, M> AuthEngine<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Runs one interactive PKCE login attempt and returns a fresh token set.
	///
	/// Persistence is the caller's responsibility; the usual next step is
	/// handing the result to a [`TokenStore`](crate::store::TokenStore) and a
	/// [`Credentials`](crate::credentials::Credentials) instance. Abandoning
	/// the attempt (an [`OtpHandler`] returning `None`, or dropping the
	/// future) leaves no state behind.
	pub async fn login(
		&self,
		identity: &str,
		secret: &str,
		otp: &mut dyn OtpHandler,
	) -> Result<TokenSet> {
		const KIND: FlowKind = FlowKind::Login;

		let span = FlowSpan::new(KIND, LoginStage::Init.as_str());

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span.instrument(self.login_conversation(identity, secret, otp)).await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	/// Runs a login attempt that cannot answer multi-factor challenges.
	///
	/// Suits identity/secret pairs sourced from the environment or other
	/// non-interactive contexts; a provider challenge surfaces as
	/// [`Error::Otp`].
	pub async fn login_noninteractive(&self, identity: &str, secret: &str) -> Result<TokenSet> {
		let mut otp = |_rejected: u32| -> Option<String> { None };

		self.login(identity, secret, &mut otp).await
	}

	async fn login_conversation(
		&self,
		identity: &str,
		secret: &str,
		otp: &mut dyn OtpHandler,
	) -> Result<TokenSet> {
		const KIND: FlowKind = FlowKind::Login;

		let pkce = {
			let _guard =
				FlowSpan::new(KIND, LoginStage::ChallengeBuilt.as_str()).entered();

			PkcePair::generate()
		};
		let submitted = FlowSpan::new(KIND, LoginStage::CredentialsSubmitted.as_str())
			.instrument(self.submit_credentials(identity, secret, &pkce))
			.await?;
		let code = match submitted {
			AuthorizeOutcome::Code(code) => code,
			AuthorizeOutcome::OtpChallenge(session) =>
				FlowSpan::new(KIND, LoginStage::OtpRequired.as_str())
					.instrument(self.run_otp_rounds(&session, otp))
					.await?,
		};
		let facade = self.facade()?;
		let tokens = FlowSpan::new(KIND, LoginStage::TokenExchanged.as_str())
			.instrument(facade.exchange_authorization_code(
				&code,
				&pkce.verifier,
				&self.provider.redirect_uri,
			))
			.await?;

		Ok(tokens)
	}

	async fn submit_credentials(
		&self,
		identity: &str,
		secret: &str,
		pkce: &PkcePair,
	) -> Result<AuthorizeOutcome> {
		let form = form_urlencoded::Serializer::new(String::new())
			.append_pair("response_type", "code")
			.append_pair("client_id", &self.provider.client_id)
			.append_pair("redirect_uri", self.provider.redirect_uri.as_str())
			.append_pair("code_challenge", &pkce.challenge)
			.append_pair("code_challenge_method", pkce::CHALLENGE_METHOD)
			.append_pair("email", identity)
			.append_pair("password", secret)
			.finish();

		self.authorize_round(form).await
	}

	/// Re-consults the handler after every rejection; the challenge session
	/// stays valid on the provider side, so the identity and secret are never
	/// resubmitted.
	async fn run_otp_rounds(&self, session: &str, otp: &mut dyn OtpHandler) -> Result<String> {
		let mut rejected = 0_u32;
		let mut last_rejection = None;

		loop {
			let Some(code) = otp.one_time_code(rejected) else {
				return Err(last_rejection.unwrap_or_else(|| Error::Otp {
					reason: "one-time code entry was abandoned".into(),
				}));
			};

			match self.submit_otp(session, &code).await {
				Ok(AuthorizeOutcome::Code(authorization_code)) => return Ok(authorization_code),
				Ok(AuthorizeOutcome::OtpChallenge(_)) =>
					return Err(NetworkError::Endpoint {
						endpoint: AUTHORIZATION_ENDPOINT,
						message: "provider re-issued a challenge for an answered round".into(),
						status: None,
					}
					.into()),
				Err(err @ Error::Otp { .. }) => {
					rejected += 1;
					last_rejection = Some(err);
				},
				Err(err) => return Err(err),
			}
		}
	}

	async fn submit_otp(&self, session: &str, code: &str) -> Result<AuthorizeOutcome> {
		let form = form_urlencoded::Serializer::new(String::new())
			.append_pair("challenge_session", session)
			.append_pair("one_time_code", code)
			.finish();

		self.authorize_round(form).await
	}

	async fn authorize_round(&self, form: String) -> Result<AuthorizeOutcome> {
		let request = Request::builder()
			.method("POST")
			.uri(self.provider.endpoints.authorization.as_str())
			.header(CONTENT_TYPE, FORM_CONTENT_TYPE)
			.header(ACCEPT, "application/json")
			.body(form.into_bytes())
			.map_err(ConfigError::HttpRequest)?;
		let slot = ResponseMetadataSlot::default();
		let handle = self.http_client.with_metadata(slot.clone());
		let response = handle.call(request).await.map_err(|err| {
			self.transport_mapper.map_transport_error(
				AUTHORIZATION_ENDPOINT,
				slot.take().as_ref(),
				err,
			)
		})?;

		parse_authorize_reply(response)
	}
}

fn parse_authorize_reply(response: HttpResponse) -> Result<AuthorizeOutcome> {
	let status = response.status();
	let body = response.into_body();
	let deserializer = &mut serde_json::Deserializer::from_slice(&body);
	let reply: AuthorizeReply = match serde_path_to_error::deserialize(deserializer) {
		Ok(reply) => reply,
		Err(source) if status.is_success() =>
			return Err(NetworkError::ResponseParse {
				endpoint: AUTHORIZATION_ENDPOINT,
				source,
				status: Some(status.as_u16()),
			}
			.into()),
		Err(_) => return Err(non_json_rejection(status)),
	};

	if status.is_success() {
		if let Some(code) = reply.code {
			return Ok(AuthorizeOutcome::Code(code));
		}
		if reply.challenge.as_deref() == Some(OTP_CHALLENGE)
			&& let Some(session) = reply.challenge_session
		{
			return Ok(AuthorizeOutcome::OtpChallenge(session));
		}

		return Err(NetworkError::Endpoint {
			endpoint: AUTHORIZATION_ENDPOINT,
			message: "response carried neither a code nor a challenge".into(),
			status: Some(status.as_u16()),
		}
		.into());
	}

	Err(classify_rejection(status, reply))
}

fn classify_rejection(status: StatusCode, reply: AuthorizeReply) -> Error {
	let reason = reply
		.error_description
		.or_else(|| reply.error.clone())
		.unwrap_or_else(|| format!("status {status}"));

	match reply.error.as_deref() {
		Some("invalid_otp" | "expired_otp") => Error::Otp { reason },
		_ if status.is_client_error() => Error::Authentication { reason },
		_ => NetworkError::Endpoint {
			endpoint: AUTHORIZATION_ENDPOINT,
			message: reason,
			status: Some(status.as_u16()),
		}
		.into(),
	}
}

fn non_json_rejection(status: StatusCode) -> Error {
	if status.is_client_error() {
		Error::Authentication {
			reason: format!("the authorization endpoint rejected the request with status {status}"),
		}
	} else {
		NetworkError::Endpoint {
			endpoint: AUTHORIZATION_ENDPOINT,
			message: "request failed without a decodable body".into(),
			status: Some(status.as_u16()),
		}
		.into()
	}
}
