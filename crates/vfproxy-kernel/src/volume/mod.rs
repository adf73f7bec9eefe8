//! Volume abstraction.
//!
//! A volume is one configured storage backend instance. It exposes vfolders
//! (virtual folders) grouped into quota scopes, and hides how the backend lays
//! them out and enforces limits.
//!
//! # Key components
//!
//! - [`Volume`]: the contract; vfolder operations are default methods
//! - [`QuotaModel`]: scope roots and limits
//! - [`FsOpModel`]: bulk copy/move/delete, scans, usage
//! - [`mangle_path`] / [`sanitize_path`]: deterministic, traversal-safe paths
//! - [`backends`]: `vfs` (plain directories), `xfs` (project quota), `share`
//!   (per-scope mounted shares)

pub mod backends;
mod ops;
mod path;
mod stream;

pub use backends::{VolumeConstructor, VolumeContext, VolumeDeps};
pub use ops::{
    DirEntryStream, FsOpModel, MAX_METADATA_SIZE, METADATA_FILENAME, QuotaModel, UPLOAD_DIRNAME,
    Volume, ensure_quota_scope,
};
pub use path::{mangle_path, sanitize_path};
pub use stream::{ByteStream, read_to_stream, write_from_stream};
