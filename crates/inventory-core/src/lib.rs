//! inventory-core: durable, encrypted persistence for the inventory desktop tool.
//!
//! # Components
//! - [`key_vault`]: generates, persists and loads the 256-bit field key.
//! - [`cipher`]: AES-256-GCM encryption of text values with that key.
//! - [`credential`]: password hashing, brute-force lockout, session idle expiry.
//! - [`store`]: pooled SQLite connection manager (WAL, checkpoints, recovery, busy retry).
//! - [`archive`]: multi-artifact backup and restore verified by SHA-256 sidecars
//!   and a per-file digest manifest.
//!
//! Components are constructed explicitly and passed to each other; there is no
//! process-global state.
//!
//! ```text
//! KeyVault ──► CipherService ──┐
//!                              ├──► StoreManager ──► ArchiveCoordinator
//! ConfigSource ────────────────┴───────────────────────────┘
//! CredentialGuard (independent, file-backed lockout state)
//! ```

pub mod archive;
pub mod cipher;
pub mod config;
pub mod credential;
pub mod error;
pub mod fsutil;
pub mod key_vault;
pub mod paths;
pub mod store;

pub use archive::{ArchiveCoordinator, BackupArchive, BackupInfo};
pub use cipher::CipherService;
pub use config::{ConfigSource, PropertiesConfig, Settings, StaticConfig};
pub use credential::CredentialGuard;
pub use error::ErrorClass;
pub use key_vault::{EncryptionKey, KeyVault};
pub use paths::Layout;
pub use store::{StoreManager, StoreOptions, StoreState};
