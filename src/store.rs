//! Storage contracts and built-in token stores.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// self
use crate::{_prelude::*, token::TokenSet};

/// Boxed future returned by [`TokenStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Durable persistence contract for the current token set.
///
/// One store holds one record: the engine serves a single user identity, and
/// replacing the record wholesale on every successful login or refresh is the
/// entire write pattern.
pub trait TokenStore
where
	Self: Send + Sync,
{
	/// Fetches the persisted token set, if one exists.
	///
	/// A missing or undecodable record is reported as absent; only genuine
	/// backend faults surface as [`StoreError`].
	fn load(&self) -> StoreFuture<'_, Option<TokenSet>>;

	/// Persists or replaces the token set.
	fn save<'a>(&'a self, tokens: &'a TokenSet) -> StoreFuture<'a, ()>;
}

/// Error type produced by [`TokenStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}
