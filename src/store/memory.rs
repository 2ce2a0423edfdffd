//! Thread-safe in-memory [`TokenStore`] for tests and memory-only credentials.

// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::{
	_prelude::*,
	store::{StoreFuture, TokenStore},
	token::TokenSet,
};

/// Keeps the token record in-process.
///
/// Used by the test suite and for credentials sourced from environment
/// variables, which must never clobber the interactive login record on disk.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
	record: Arc<RwLock<Option<TokenSet>>>,
	saves: Arc<AtomicU64>,
}
impl MemoryStore {
	/// Creates a store seeded with an existing record.
	pub fn seeded(tokens: TokenSet) -> Self {
		Self { record: Arc::new(RwLock::new(Some(tokens))), saves: Arc::default() }
	}

	/// Returns the stored record without going through the trait.
	pub fn snapshot(&self) -> Option<TokenSet> {
		self.record.read().clone()
	}

	/// Number of completed `save` calls.
	pub fn saves(&self) -> u64 {
		self.saves.load(Ordering::Relaxed)
	}
}
impl TokenStore for MemoryStore {
	fn load(&self) -> StoreFuture<'_, Option<TokenSet>> {
		Box::pin(async move { Ok(self.record.read().clone()) })
	}

	fn save<'a>(&'a self, tokens: &'a TokenSet) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			*self.record.write() = Some(tokens.clone());
			self.saves.fetch_add(1, Ordering::Relaxed);

			Ok(())
		})
	}
}
