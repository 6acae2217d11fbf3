//! Typed daemon operations over one [`Transport`].
//!
//! Each operation connects lazily, issues one command and waits for the
//! reply carrying its id. A reply the daemon marks as an error becomes
//! [`NetError::Daemon`] with the daemon's own wording.

use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use signald_bridge_shared::{
    Address, Command, DaemonFrame, DaemonGroup, InternalGroupId, Request, RequestAttachment,
    RequestId,
};

use crate::error::{NetError, Result};
use crate::subscription::Subscription;
use crate::transport::Transport;

/// Who a message goes to.
#[derive(Debug, Clone, PartialEq)]
pub enum SendTarget {
    Number(String),
    Group(InternalGroupId),
}

pub struct DaemonClient {
    transport: Transport,
    request_timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        Self {
            transport: Transport::new(socket_path),
            request_timeout,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub async fn register(&self, number: &str, use_voice: bool) -> Result<()> {
        self.call(Command::Register {
            username: number.to_string(),
            voice: use_voice,
        })
        .await?;
        Ok(())
    }

    pub async fn verify(&self, number: &str, code: &str, pin: Option<&str>) -> Result<()> {
        self.call(Command::Verify {
            username: number.to_string(),
            code: code.to_string(),
            pin: pin.map(str::to_string),
        })
        .await?;
        Ok(())
    }

    pub async fn send(
        &self,
        number: &str,
        target: &SendTarget,
        message: &str,
        attachments: &[RequestAttachment],
    ) -> Result<()> {
        let (recipient_address, recipient_group_id) = match target {
            SendTarget::Number(to) => (Some(Address { number: to.clone() }), None),
            SendTarget::Group(group) => (None, Some(group.clone())),
        };

        self.call(Command::Send {
            username: number.to_string(),
            recipient_address,
            recipient_group_id,
            message_body: message.to_string(),
            attachments: attachments.to_vec(),
            quote: None,
        })
        .await?;
        Ok(())
    }

    pub async fn list_groups(&self, number: &str) -> Result<Vec<DaemonGroup>> {
        let frame = self
            .call(Command::ListGroups {
                username: number.to_string(),
            })
            .await?;
        Ok(frame.groups()?)
    }

    pub async fn create_group(&self, number: &str, name: &str, members: &[String]) -> Result<()> {
        self.call(Command::CreateGroup {
            username: number.to_string(),
            group_name: name.to_string(),
            members: members.to_vec(),
        })
        .await?;
        Ok(())
    }

    pub async fn leave_group(&self, number: &str, group: &InternalGroupId) -> Result<()> {
        self.call(Command::LeaveGroup {
            username: number.to_string(),
            recipient_group_id: group.clone(),
        })
        .await?;
        Ok(())
    }

    /// Issue a link command. Without `existing` a fresh id is used and the
    /// reply carries the linking URI; with it, the reply is the outcome of
    /// the earlier attempt. Waits up to `timeout`.
    pub async fn link(
        &self,
        device_name: &str,
        existing: Option<RequestId>,
        timeout: Duration,
    ) -> Result<(RequestId, DaemonFrame)> {
        let command = Command::Link {
            device_name: device_name.to_string(),
        };
        let request = match existing {
            Some(id) => Request::with_id(id, command),
            None => Request::new(command),
        };
        let id = request.id.clone();
        let frame = self.call_request(request, timeout).await?;
        Ok((id, frame))
    }

    /// Start a receive stream for `number`.
    pub async fn subscribe(&self, number: &str) -> Result<Subscription> {
        self.transport.connect().await?;
        let request = Request::new(Command::Subscribe {
            username: number.to_string(),
        });
        self.transport.subscribe(request, number).await
    }

    async fn call(&self, command: Command) -> Result<DaemonFrame> {
        self.call_request(Request::new(command), self.request_timeout)
            .await
    }

    async fn call_request(&self, request: Request, timeout: Duration) -> Result<DaemonFrame> {
        self.transport.connect().await?;

        let kind = request.command.kind();
        let id = request.id.clone();
        let frame = self.transport.request(request, timeout).await?;
        debug!(id = %id, command = kind, reply = %frame.kind, "Daemon replied");

        if frame.is_error() {
            return Err(NetError::Daemon(frame.error_detail()));
        }
        Ok(frame)
    }
}
