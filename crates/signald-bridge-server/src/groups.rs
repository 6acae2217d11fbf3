//! Group views built from fresh daemon queries.

use tracing::{info, warn};

use signald_bridge_net::DaemonClient;
use signald_bridge_shared::{decode_group_id, encode_group_id, GroupEntry, InternalGroupId};

use crate::error::ServerError;

pub async fn list_groups(client: &DaemonClient, number: &str) -> Result<Vec<GroupEntry>, ServerError> {
    let groups = client.list_groups(number).await?;
    Ok(groups
        .into_iter()
        .map(|group| GroupEntry::from_daemon(number, group))
        .collect())
}

/// Create a group and return its public id.
///
/// The daemon does not answer with the new id, so it is looked up by name
/// afterwards. With no match the id of the empty internal id is returned.
pub async fn create_group(
    client: &DaemonClient,
    number: &str,
    name: &str,
    members: &[String],
) -> Result<String, ServerError> {
    client.create_group(number, name, members).await?;

    let groups = client.list_groups(number).await?;
    let internal = match groups.into_iter().find(|g| g.name == name) {
        Some(group) => group.group_id,
        None => {
            warn!(number, name, "Created group not found in group list");
            InternalGroupId(String::new())
        }
    };

    let id = encode_group_id(&internal);
    info!(number, name, id = %id, "Group created");
    Ok(id)
}

pub async fn leave_group(
    client: &DaemonClient,
    number: &str,
    public_id: &str,
) -> Result<(), ServerError> {
    if public_id.is_empty() {
        return Err(ServerError::Validation("Please specify a group id".into()));
    }
    let internal = decode_group_id(public_id)?;

    client.leave_group(number, &internal).await?;
    info!(number, id = public_id, "Left group");
    Ok(())
}
