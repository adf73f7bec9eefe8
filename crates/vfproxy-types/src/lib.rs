//! Shared types for vfproxy.
//!
//! This crate has **no internal vfproxy dependencies**: identifiers, the
//! capability vocabulary, directory-entry records, and the quota/usage read and
//! write models that every backend and the Watcher protocol speak.
//!
//! # Identity Overview
//!
//! ```text
//! Volume (VolumeId, name) ← one configured backend instance on a node
//!     └── mount path
//!         └── quota scope root (QuotaScopeId → 32-hex pathname)
//!             └── vfolder (VFolderId → ab/cd/<rest of hex>)
//! ```
//!
//! # Key Types
//!
//! |-------------------|-------------------------------------------------|
//! | Type              | Purpose                                         |
//! |-------------------|-------------------------------------------------|
//! | [`VolumeId`]      | Deterministic id of a configured volume          |
//! | [`QuotaScopeId`]  | Accounting unit (user or project)                |
//! | [`VFolderId`]     | Virtual folder (optional scope + folder UUID)    |
//! | [`Capability`]    | Feature flag advertised by a backend             |
//! | [`DirEntry`]      | One record of a directory scan                   |
//! | [`QuotaUsage`]    | Quota read model                                 |
//! | [`QuotaConfig`]   | Quota write model                                |
//! | [`TreeUsage`]     | File count + bytes of a subtree                  |
//! |-------------------|-------------------------------------------------|

pub mod capability;
pub mod fs;
pub mod ids;
pub mod usage;

pub use capability::{Capability, CapabilitySet};
pub use fs::{DirEntry, DirEntryType, Stat};
pub use ids::{IdParseError, QuotaScopeId, QuotaScopeType, VFolderId, VolumeId};
pub use usage::{
    CapacityUsage, FsPerfMetric, HardwareMetadata, HealthStatus, QuotaConfig, QuotaConfigError,
    QuotaUsage, TreeUsage,
};
