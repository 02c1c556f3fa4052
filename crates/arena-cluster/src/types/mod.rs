mod node_descriptor;
mod peer_address;
mod snapshot;

pub use node_descriptor::{directory_path, NodeDescriptor, PROTOCOL_VERSION};
pub use peer_address::PeerAddress;
pub use snapshot::{Member, MembershipSnapshot};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_address_display_and_url() {
        let addr = PeerAddress::new("10.0.0.1", 9000);
        assert_eq!(addr.to_string(), "10.0.0.1:9000");
        assert_eq!(addr.base_url(), "http://10.0.0.1:9000");
    }

    #[test]
    fn descriptor_json_round_trip() {
        let node = NodeDescriptor::new("901", "dev.101", "192.168.1.4", 7001);
        let bytes = serde_json::to_vec(&node).unwrap();
        let decoded: NodeDescriptor = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(node, decoded);
    }
}
