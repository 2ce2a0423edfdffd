// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{Rng, distr::Alphanumeric};
use sha2::{Digest, Sha256};

// RFC 7636 permits 43..=128 unreserved characters.
const PKCE_VERIFIER_LEN: usize = 64;

/// RFC 7636 identifier for the SHA-256 challenge method.
pub(crate) const CHALLENGE_METHOD: &str = "S256";

/// PKCE verifier/challenge pair scoped to one login attempt.
///
/// The verifier exists only in process memory; the authorization request
/// carries the challenge, and the token exchange presents the verifier.
#[derive(Clone)]
pub(crate) struct PkcePair {
	pub(crate) verifier: String,
	pub(crate) challenge: String,
}
impl PkcePair {
	pub(crate) fn generate() -> Self {
		let verifier: String =
			rand::rng().sample_iter(Alphanumeric).take(PKCE_VERIFIER_LEN).map(char::from).collect();
		let challenge = compute_challenge(&verifier);

		Self { verifier, challenge }
	}
}

fn compute_challenge(verifier: &str) -> String {
	let mut hasher = Sha256::new();

	hasher.update(verifier.as_bytes());

	URL_SAFE_NO_PAD.encode(hasher.finalize())
}
