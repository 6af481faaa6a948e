//! Orchestration for kiln: the `Engine` context object.
//!
//! The engine owns the local store, the remote sync engine, and the cache
//! settings, and exposes the user-level operations: export, install (with
//! the per-package build policy), upload, remove, copy, search, verify, and
//! garbage collection. Building is delegated to a [`RecipeCallbacks`]
//! implementation; [`KilnfileRecipe`] is the declarative one used by the CLI.

pub mod callbacks;
pub mod concurrency;
pub mod engine;
pub mod lifecycle;
pub mod policy;
pub mod settings;

pub use callbacks::{
    BoxError, BuildContext, CallbackResult, KilnfileRecipe, PackageContext, RecipeCallbacks, SourceContext,
};
pub use concurrency::{install_signal_handler, shutdown_requested, CancelToken};
pub use engine::{
    CopyReport, Engine, ExportResult, InstallOptions, InstallResult, PackageSummary, RecipeInfo,
    UploadRequest,
};
pub use lifecycle::validate_transition;
pub use policy::{resolve, BuildMode, BuildReason, Decision, LocalPackage, RemoteProbe};
pub use settings::{resolve_cache_root, Settings};

use kiln_schema::PackageReference;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Schema(#[from] kiln_schema::SchemaError),
    #[error(transparent)]
    Store(#[from] kiln_store::StoreError),
    #[error(transparent)]
    Remote(#[from] kiln_remote::RemoteError),
    #[error("missing prebuilt package {package} under build policy '{policy}'; nothing was built")]
    MissingBinary {
        package: PackageReference,
        policy: String,
    },
    #[error("{stage} of {package} failed: {reason}")]
    BuildFailed {
        package: String,
        stage: String,
        reason: String,
    },
    #[error("invalid package state transition for {package}: {from} -> {to}")]
    InvalidTransition {
        package: String,
        from: String,
        to: String,
    },
    #[error("invalid build mode: {0}")]
    InvalidBuildMode(String),
    #[error("invalid settings in {path}: {reason}")]
    Settings { path: String, reason: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0} cancelled")]
    Cancelled(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Store(e) => e.is_not_found(),
            Self::Remote(e) => e.is_not_found(),
            _ => false,
        }
    }
}
