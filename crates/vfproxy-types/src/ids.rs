//! Typed identifiers for volumes, quota scopes, and virtual folders.
//!
//! `QuotaScopeId` and `VFolderId` have stable text encodings that are used on
//! the wire and in logs:
//!
//! - quota scope: `"{type}:{uuid}"`, e.g. `user:6a7f…`
//! - vfolder: `"{quota_scope_id}/{folder_hex}"`, or the bare folder hex for
//!   legacy folders that predate quota scopes
//!
//! Both parse back losslessly. `VolumeId` is deterministic: a UUIDv5 over the
//! node id and the configured volume name, so restarts agree without state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Error from parsing an identifier's text form.
#[derive(Debug, thiserror::Error)]
pub enum IdParseError {
    #[error("invalid quota scope type '{0}'")]
    ScopeType(String),
    #[error("invalid quota scope id '{0}': expected '<type>:<uuid>'")]
    QuotaScope(String),
    #[error("invalid vfolder id '{0}'")]
    VFolder(String),
    #[error("invalid uuid in '{input}': {source}")]
    Uuid {
        input: String,
        #[source]
        source: uuid::Error,
    },
}

fn parse_uuid(input: &str, whole: &str) -> Result<Uuid, IdParseError> {
    Uuid::parse_str(input).map_err(|source| IdParseError::Uuid {
        input: whole.to_string(),
        source,
    })
}

// ── Quota scopes ────────────────────────────────────────────────────────────

/// Kind of accounting unit a quota scope belongs to.
#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QuotaScopeType {
    User,
    Project,
}

/// Identifies one quota scope: a user's or a project's slice of a volume.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct QuotaScopeId {
    pub scope_type: QuotaScopeType,
    pub scope_id: Uuid,
}

impl QuotaScopeId {
    pub fn new(scope_type: QuotaScopeType, scope_id: Uuid) -> Self {
        Self {
            scope_type,
            scope_id,
        }
    }

    pub fn user(scope_id: Uuid) -> Self {
        Self::new(QuotaScopeType::User, scope_id)
    }

    pub fn project(scope_id: Uuid) -> Self {
        Self::new(QuotaScopeType::Project, scope_id)
    }

    /// Directory name of the scope root under a volume's mount path.
    ///
    /// The 32-character simple hex of the scope UUID. The scope type is not
    /// part of the path, so a user and a project sharing a UUID collide.
    pub fn pathname(&self) -> String {
        self.scope_id.as_simple().to_string()
    }
}

impl fmt::Display for QuotaScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope_type, self.scope_id)
    }
}

impl fmt::Debug for QuotaScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuotaScopeId({self})")
    }
}

impl FromStr for QuotaScopeId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| IdParseError::QuotaScope(s.to_string()))?;
        let scope_type = kind
            .parse::<QuotaScopeType>()
            .map_err(|_| IdParseError::ScopeType(kind.to_string()))?;
        Ok(Self::new(scope_type, parse_uuid(id, s)?))
    }
}

// ── Virtual folders ─────────────────────────────────────────────────────────

/// Identifies one virtual folder.
///
/// `quota_scope_id` is `None` only for legacy folders, which live directly
/// under the volume mount path.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct VFolderId {
    pub quota_scope_id: Option<QuotaScopeId>,
    pub folder_id: Uuid,
}

impl VFolderId {
    pub fn new(quota_scope_id: QuotaScopeId, folder_id: Uuid) -> Self {
        Self {
            quota_scope_id: Some(quota_scope_id),
            folder_id,
        }
    }

    /// A folder that predates quota scopes.
    pub fn legacy(folder_id: Uuid) -> Self {
        Self {
            quota_scope_id: None,
            folder_id,
        }
    }

    /// A fresh random folder inside `quota_scope_id`.
    pub fn random(quota_scope_id: QuotaScopeId) -> Self {
        Self::new(quota_scope_id, Uuid::new_v4())
    }

    /// 32-character hex of the folder UUID.
    pub fn folder_hex(&self) -> String {
        self.folder_id.as_simple().to_string()
    }
}

impl fmt::Display for VFolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.quota_scope_id {
            Some(qsid) => write!(f, "{qsid}/{}", self.folder_id.as_simple()),
            None => write!(f, "{}", self.folder_id.as_simple()),
        }
    }
}

impl fmt::Debug for VFolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VFolderId({self})")
    }
}

impl FromStr for VFolderId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdParseError::VFolder(s.to_string()));
        }
        match s.rsplit_once('/') {
            Some((qsid, folder)) => Ok(Self::new(qsid.parse()?, parse_uuid(folder, s)?)),
            None => Ok(Self::legacy(parse_uuid(s, s)?)),
        }
    }
}

// ── String-form serde ───────────────────────────────────────────────────────

macro_rules! impl_string_serde {
    ($T:ident) => {
        impl Serialize for $T {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_string_serde!(QuotaScopeId);
impl_string_serde!(VFolderId);

// ── Volumes ─────────────────────────────────────────────────────────────────

/// Fixed namespace for deriving deterministic VolumeIds via UUIDv5.
const VOLUME_NS: Uuid = uuid::uuid!("3f0c9d4e-52a1-4b7e-9c36-8d2e61f0a7b5");

/// Identifies one configured backend instance on a proxy node.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(Uuid);

impl VolumeId {
    /// Deterministic id for volume `name` on node `node_id`.
    pub fn derive(node_id: &str, name: &str) -> Self {
        Self(Uuid::new_v5(&VOLUME_NS, format!("{node_id}/{name}").as_bytes()))
    }

    /// First 8 hex characters, for human display only.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for VolumeId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({})", self.short())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> QuotaScopeId {
        QuotaScopeId::user(uuid::uuid!("6a7f3c2e-1d4b-4f8a-9e0c-b5d6a7e8f901"))
    }

    #[test]
    fn test_quota_scope_text_form() {
        let qsid = scope();
        assert_eq!(qsid.to_string(), "user:6a7f3c2e-1d4b-4f8a-9e0c-b5d6a7e8f901");
        assert_eq!(qsid.pathname(), "6a7f3c2e1d4b4f8a9e0cb5d6a7e8f901");
    }

    #[test]
    fn test_quota_scope_parse_roundtrip() {
        let qsid = QuotaScopeId::project(Uuid::new_v4());
        let parsed: QuotaScopeId = qsid.to_string().parse().unwrap();
        assert_eq!(parsed, qsid);
    }

    #[test]
    fn test_quota_scope_accepts_simple_hex() {
        let parsed: QuotaScopeId = "project:6a7f3c2e1d4b4f8a9e0cb5d6a7e8f901".parse().unwrap();
        assert_eq!(parsed.scope_type, QuotaScopeType::Project);
        assert_eq!(parsed.scope_id, scope().scope_id);
    }

    #[test]
    fn test_quota_scope_rejects_bad_input() {
        assert!(matches!(
            "nope".parse::<QuotaScopeId>(),
            Err(IdParseError::QuotaScope(_))
        ));
        assert!(matches!(
            "group:6a7f3c2e1d4b4f8a9e0cb5d6a7e8f901".parse::<QuotaScopeId>(),
            Err(IdParseError::ScopeType(_))
        ));
        assert!(matches!(
            "user:not-a-uuid".parse::<QuotaScopeId>(),
            Err(IdParseError::Uuid { .. })
        ));
    }

    #[test]
    fn test_vfolder_text_form() {
        let folder = uuid::uuid!("0123456789abcdef0123456789abcdef");
        let vfid = VFolderId::new(scope(), folder);
        assert_eq!(
            vfid.to_string(),
            "user:6a7f3c2e-1d4b-4f8a-9e0c-b5d6a7e8f901/0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn test_vfolder_parse_roundtrip() {
        let vfid = VFolderId::random(scope());
        let parsed: VFolderId = vfid.to_string().parse().unwrap();
        assert_eq!(parsed, vfid);
    }

    #[test]
    fn test_legacy_vfolder_roundtrip() {
        let vfid = VFolderId::legacy(Uuid::new_v4());
        let text = vfid.to_string();
        assert_eq!(text.len(), 32);
        let parsed: VFolderId = text.parse().unwrap();
        assert_eq!(parsed, vfid);
        assert!(parsed.quota_scope_id.is_none());
    }

    #[test]
    fn test_vfolder_rejects_empty() {
        assert!(matches!("".parse::<VFolderId>(), Err(IdParseError::VFolder(_))));
    }

    #[test]
    fn test_vfolder_serde_is_text() {
        let vfid = VFolderId::random(scope());
        let json = serde_json::to_string(&vfid).unwrap();
        assert_eq!(json, format!("\"{vfid}\""));
        let back: VFolderId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vfid);
    }

    #[test]
    fn test_vfolder_postcard_roundtrip() {
        let vfid = VFolderId::random(scope());
        let bytes = postcard::to_allocvec(&vfid).unwrap();
        let back: VFolderId = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, vfid);
    }

    #[test]
    fn test_volume_id_is_deterministic() {
        assert_eq!(
            VolumeId::derive("node01", "local"),
            VolumeId::derive("node01", "local")
        );
        assert_ne!(
            VolumeId::derive("node01", "local"),
            VolumeId::derive("node02", "local")
        );
        assert_ne!(
            VolumeId::derive("node01", "local"),
            VolumeId::derive("node01", "scratch")
        );
    }
}
