use std::collections::BTreeSet;

use crate::types::NodeDescriptor;

/// A cluster member as seen in one membership snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub path: String,
    /// True iff this is the local process's own registration.
    pub is_self: bool,
    pub data: NodeDescriptor,
}

/// Immutable view of the cluster, rebuilt on every children-watch firing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub generation: u64,
    pub members: Vec<Member>,
}

impl MembershipSnapshot {
    pub fn new(generation: u64, members: Vec<Member>) -> Self {
        Self {
            generation,
            members,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Distinct service ids present in this snapshot.
    pub fn service_ids(&self) -> BTreeSet<String> {
        self.members
            .iter()
            .map(|m| m.data.service_id.clone())
            .collect()
    }

    /// Members belonging to `service_id`, in snapshot order.
    pub fn nodes_by_id(&self, service_id: &str) -> Vec<Member> {
        self.members
            .iter()
            .filter(|m| m.data.service_id == service_id)
            .cloned()
            .collect()
    }

    /// The local process's own entry, if it is present.
    pub fn local(&self) -> Option<&Member> {
        self.members.iter().find(|m| m.is_self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(service_id: &str, ip: &str, is_self: bool) -> Member {
        let data = NodeDescriptor::new(service_id, "dev", ip, 9000);
        Member {
            path: data.path(),
            is_self,
            data,
        }
    }

    #[test]
    fn nodes_by_id_preserves_order() {
        let snapshot = MembershipSnapshot::new(
            1,
            vec![
                member("901", "10.0.0.3", false),
                member("902", "10.0.0.1", true),
                member("901", "10.0.0.2", false),
            ],
        );

        let ips: Vec<_> = snapshot
            .nodes_by_id("901")
            .into_iter()
            .map(|m| m.data.ip)
            .collect();
        assert_eq!(ips, vec!["10.0.0.3", "10.0.0.2"]);
        assert!(snapshot.nodes_by_id("903").is_empty());
    }

    #[test]
    fn service_ids_are_distinct() {
        let snapshot = MembershipSnapshot::new(
            1,
            vec![
                member("901", "10.0.0.1", false),
                member("901", "10.0.0.2", false),
                member("902", "10.0.0.3", false),
            ],
        );
        let ids: Vec<_> = snapshot.service_ids().into_iter().collect();
        assert_eq!(ids, vec!["901", "902"]);
    }

    #[test]
    fn local_finds_self_entry() {
        let snapshot = MembershipSnapshot::new(
            3,
            vec![member("901", "10.0.0.1", false), member("902", "10.0.0.2", true)],
        );
        assert_eq!(snapshot.local().unwrap().data.ip, "10.0.0.2");
        assert!(MembershipSnapshot::default().local().is_none());
    }
}
