use serde::{Deserialize, Serialize};

use crate::types::PeerAddress;

/// Protocol version written into every registration.
pub const PROTOCOL_VERSION: u32 = 1;

/// One cluster member as stored in its ephemeral coordination node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub version: u32,
    /// `"{ip}:{port}"`, also the node's path segment.
    pub uuid: String,
    pub service_id: String,
    pub profiles: String,
    pub ip: String,
    pub port: u16,
}

impl NodeDescriptor {
    pub fn new(
        service_id: impl Into<String>,
        profiles: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
    ) -> Self {
        let ip = ip.into();
        Self {
            version: PROTOCOL_VERSION,
            uuid: format!("{ip}:{port}"),
            service_id: service_id.into(),
            profiles: profiles.into(),
            ip,
            port,
        }
    }

    pub fn address(&self) -> PeerAddress {
        PeerAddress::new(self.ip.clone(), self.port)
    }

    /// Directory holding every member of this deployment profile.
    pub fn directory(&self) -> String {
        directory_path(&self.profiles)
    }

    /// Path of this member's ephemeral node.
    pub fn path(&self) -> String {
        format!("{}/{}", self.directory(), self.uuid)
    }
}

pub fn directory_path(profiles: &str) -> String {
    format!("/{profiles}")
}
