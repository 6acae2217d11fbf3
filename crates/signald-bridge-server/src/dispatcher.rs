//! Message dispatch: recipient validation, attachment materialization and
//! one daemon `send` per resolved target.

use std::path::PathBuf;

use tracing::{info, warn};

use signald_bridge_net::{DaemonClient, SendTarget};
use signald_bridge_shared::{decode_group_id, is_group_id, RequestAttachment};

use crate::attachments::{self, AttachmentFile};
use crate::error::ServerError;

/// How the recipient list of a send call is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientMode {
    /// `/v1/send`: the caller states whether the single target is a group.
    Explicit { is_group: bool },
    /// `/v2/send`: groups are recognised by their `group.` prefix.
    Mixed,
}

/// One outgoing message as received from the HTTP caller.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub number: String,
    pub message: String,
    pub recipients: Vec<String>,
    pub base64_attachments: Vec<String>,
    pub mode: RecipientMode,
}

/// Turn the caller's recipient list into daemon targets, in order.
///
/// All validation happens here, before any file is written or any command
/// is issued.
pub fn resolve_targets(
    recipients: &[String],
    mode: RecipientMode,
) -> Result<Vec<SendTarget>, ServerError> {
    if recipients.is_empty() {
        return Err(ServerError::Validation(
            "Please specify at least one recipient".into(),
        ));
    }

    match mode {
        RecipientMode::Explicit { is_group: true } => {
            if recipients.len() > 1 {
                return Err(ServerError::Validation(
                    "More than one group is currently not allowed".into(),
                ));
            }
            let group = decode_group_id(&recipients[0])?;
            Ok(vec![SendTarget::Group(group)])
        }
        RecipientMode::Explicit { is_group: false } => Ok(recipients
            .iter()
            .map(|to| SendTarget::Number(to.clone()))
            .collect()),
        RecipientMode::Mixed => {
            let groups = recipients.iter().filter(|r| is_group_id(r)).count();
            if groups > 0 && groups < recipients.len() {
                return Err(ServerError::Validation(
                    "Signal Messenger Groups and phone numbers cannot be specified together \
                     in one request! Please split them up into multiple REST API calls."
                        .into(),
                ));
            }

            recipients
                .iter()
                .map(|to| -> Result<SendTarget, ServerError> {
                    if is_group_id(to) {
                        Ok(SendTarget::Group(decode_group_id(to)?))
                    } else {
                        Ok(SendTarget::Number(to.clone()))
                    }
                })
                .collect()
        }
    }
}

/// Validate, materialize attachments and send to every target in order.
///
/// The first failed send aborts the remaining ones. Targets already
/// accepted by the daemon stay delivered.
pub async fn send_message(
    client: &DaemonClient,
    attachment_dir: PathBuf,
    outgoing: OutgoingMessage,
) -> Result<(), ServerError> {
    let targets = resolve_targets(&outgoing.recipients, outgoing.mode)?;

    let blobs = outgoing.base64_attachments;
    let files: Vec<AttachmentFile> =
        tokio::task::spawn_blocking(move || attachments::materialize(&attachment_dir, &blobs))
            .await
            .map_err(|e| ServerError::Internal(format!("Attachment task failed: {e}")))??;
    let references: Vec<RequestAttachment> = files.iter().map(AttachmentFile::as_request).collect();

    for (sent, target) in targets.iter().enumerate() {
        if let Err(e) = client
            .send(&outgoing.number, target, &outgoing.message, &references)
            .await
        {
            warn!(
                number = %outgoing.number,
                accepted = sent,
                total = targets.len(),
                error = %e,
                "Send aborted"
            );
            return Err(e.into());
        }
    }

    info!(
        number = %outgoing.number,
        targets = targets.len(),
        attachments = files.len(),
        attachment_bytes = files.iter().map(AttachmentFile::size).sum::<usize>(),
        "Message sent"
    );

    // Attachment files are removed here, after the daemon has read them
    drop(files);
    Ok(())
}
