//! File-backed [`TokenStore`] with atomic replacement and owner-only permissions.

// std
use std::{
	fs::{self, File},
	io::{ErrorKind, Write},
	path::{Path, PathBuf},
};
// crates.io
use directories::ProjectDirs;
// self
use crate::{
	_prelude::*,
	store::{StoreError, StoreFuture, TokenStore},
	token::TokenSet,
};

const TOKEN_FILE: &str = "tokens.json";

/// Persists the token set to a single JSON file.
///
/// Writes go to a sibling temporary file that is fsynced and renamed over the
/// record, so a concurrent [`load`](TokenStore::load) never observes a
/// partially written file. Permissions are restricted to the owner before any
/// secret reaches disk.
#[derive(Clone, Debug)]
pub struct FileStore {
	path: PathBuf,
	write_guard: Arc<Mutex<()>>,
}
impl FileStore {
	/// Opens a store at the provided path. The file itself may not exist yet.
	pub fn open(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into(), write_guard: Arc::new(Mutex::new(())) }
	}

	/// Opens a store at the platform-conventional per-user configuration path.
	pub fn open_default() -> Result<Self, StoreError> {
		Ok(Self::open(Self::default_path()?))
	}

	/// Platform-conventional location of the persisted token record.
	pub fn default_path() -> Result<PathBuf, StoreError> {
		let dirs = ProjectDirs::from("com", "Connect", "connect-client").ok_or_else(|| {
			StoreError::Backend {
				message: "No home directory is available to resolve the configuration path."
					.into(),
			}
		})?;

		Ok(dirs.config_dir().join(TOKEN_FILE))
	}

	/// Path this store reads and writes.
	pub fn path(&self) -> &Path {
		&self.path
	}

	fn read_record(path: &Path) -> Result<Option<TokenSet>, StoreError> {
		let bytes = match fs::read(path) {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
			Err(e) =>
				return Err(StoreError::Backend {
					message: format!("Failed to read {}: {e}", path.display()),
				}),
		};

		if bytes.is_empty() {
			return Ok(None);
		}

		match serde_json::from_slice(&bytes) {
			Ok(tokens) => Ok(Some(tokens)),
			Err(e) => {
				#[cfg(feature = "tracing")]
				tracing::warn!(
					path = %path.display(),
					error = %e,
					"Ignoring undecodable token record.",
				);
				#[cfg(not(feature = "tracing"))]
				let _ = e;

				Ok(None)
			},
		}
	}

	fn ensure_parent_exists(path: &Path) -> Result<(), StoreError> {
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
				message: format!("Failed to create store directory {}: {e}", parent.display()),
			})?;
		}

		Ok(())
	}

	fn persist(&self, tokens: &TokenSet) -> Result<(), StoreError> {
		let _write = self.write_guard.lock();

		Self::ensure_parent_exists(&self.path)?;

		let serialized =
			serde_json::to_vec_pretty(tokens).map_err(|e| StoreError::Serialization {
				message: format!("Failed to serialize token record: {e}"),
			})?;
		let tmp_path = self.path.with_extension("tmp");

		{
			let mut file = File::create(&tmp_path).map_err(|e| StoreError::Backend {
				message: format!("Failed to create {}: {e}", tmp_path.display()),
			})?;

			Self::restrict_to_owner(&tmp_path)?;
			file.write_all(&serialized).map_err(|e| StoreError::Backend {
				message: format!("Failed to write {}: {e}", tmp_path.display()),
			})?;
			file.sync_all().map_err(|e| StoreError::Backend {
				message: format!("Failed to sync {}: {e}", tmp_path.display()),
			})?;
		}

		fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::Backend {
			message: format!("Failed to replace {}: {e}", self.path.display()),
		})?;

		Self::restrict_to_owner(&self.path)
	}

	#[cfg(unix)]
	fn restrict_to_owner(path: &Path) -> Result<(), StoreError> {
		use std::os::unix::fs::PermissionsExt;

		fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
			StoreError::Backend {
				message: format!("Failed to restrict permissions on {}: {e}", path.display()),
			}
		})
	}

	#[cfg(not(unix))]
	fn restrict_to_owner(_path: &Path) -> Result<(), StoreError> {
		Ok(())
	}
}
impl TokenStore for FileStore {
	fn load(&self) -> StoreFuture<'_, Option<TokenSet>> {
		Box::pin(async move { Self::read_record(&self.path) })
	}

	fn save<'a>(&'a self, tokens: &'a TokenSet) -> StoreFuture<'a, ()> {
		Box::pin(async move { self.persist(tokens) })
	}
}
