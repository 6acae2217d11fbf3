//! Group identity codec and group views.
//!
//! The daemon identifies groups by an opaque string. HTTP callers only ever
//! see the public form `group.<base64 of the internal id>`, which keeps
//! group targets distinguishable from phone numbers in one recipient list.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::constants::GROUP_PREFIX;
use crate::error::GroupIdError;
use crate::types::InternalGroupId;

/// Encode an internal id into its public form. Total and injective.
pub fn encode_group_id(internal: &InternalGroupId) -> String {
    format!("{GROUP_PREFIX}{}", STANDARD.encode(internal.as_str()))
}

/// Decode a public group id. The `group.` prefix is optional.
pub fn decode_group_id(public: &str) -> Result<InternalGroupId, GroupIdError> {
    let encoded = public.strip_prefix(GROUP_PREFIX).unwrap_or(public);
    let bytes = STANDARD.decode(encoded)?;
    let internal = String::from_utf8(bytes).map_err(|_| GroupIdError::NotUtf8)?;
    Ok(InternalGroupId(internal))
}

/// Whether a recipient names a group rather than a number.
pub fn is_group_id(recipient: &str) -> bool {
    recipient.starts_with(GROUP_PREFIX)
}

/// A group as listed by the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonGroup {
    #[serde(rename = "groupId")]
    pub group_id: InternalGroupId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub members: Vec<DaemonGroupMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonGroupMember {
    /// Members known only by uuid have no number
    #[serde(default)]
    pub number: Option<String>,
}

/// Public view of a group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupEntry {
    pub name: String,
    pub id: String,
    pub internal_id: String,
    pub members: Vec<String>,
    pub active: bool,
    pub blocked: bool,
}

impl GroupEntry {
    /// Build the view of `group` as seen by the account `number`.
    pub fn from_daemon(number: &str, group: DaemonGroup) -> Self {
        let members: Vec<String> = group.members.into_iter().filter_map(|m| m.number).collect();
        let active = members.iter().any(|m| m == number);

        Self {
            name: group.name,
            id: encode_group_id(&group.group_id),
            internal_id: group.group_id.0,
            members,
            active,
            // signald's group list carries no block state
            blocked: false,
        }
    }
}
