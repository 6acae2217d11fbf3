use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation id carried by a command and echoed by its reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier the daemon issues for a group; never shown to HTTP callers
/// except inside a public group id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct InternalGroupId(pub String);

impl InternalGroupId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InternalGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_request_id_serializes_as_plain_string() {
        let id = RequestId::from("abc-123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc-123\"");
    }
}
