//! Communication groups and their process-wide cache.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use hashbrown::HashMap;
use log::{debug, trace};
use spin::Mutex;

use crate::sharding::ProcessId;

/// Identifier of a process group, unique within a [`ProcessGroupRegistry`].
pub type GroupId = usize;

/// Kind of communication a process group is set up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupType {
    /// Point-to-point send/receive between exactly two processes.
    P2P,
    /// Collective operations (all-reduce, all-gather, ...) over every member.
    Collective,
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupType::P2P => f.write_str("p2p"),
            GroupType::Collective => f.write_str("collective"),
        }
    }
}

/// A communication channel between an ordered list of processes.
///
/// The order of `ranks` is significant: `[0, 2]` and `[2, 0]` are distinct groups, and the
/// local rank of a process is its position in that list.
#[derive(Debug, PartialEq, Eq)]
pub struct ProcessGroup {
    id: GroupId,
    ranks: Vec<ProcessId>,
    group_type: GroupType,
}

impl ProcessGroup {
    /// The group's identifier.
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Global ranks of the members, in group order.
    pub fn ranks(&self) -> &[ProcessId] {
        &self.ranks
    }

    /// Kind of the group.
    pub fn group_type(&self) -> GroupType {
        self.group_type
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Whether `rank` is a member.
    pub fn contains(&self, rank: ProcessId) -> bool {
        self.ranks.contains(&rank)
    }

    /// Position of global `rank` inside the group.
    pub fn local_rank(&self, rank: ProcessId) -> Option<usize> {
        self.ranks.iter().position(|&r| r == rank)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    ranks: Vec<ProcessId>,
    group_type: GroupType,
}

#[derive(Debug)]
struct RegistryState {
    groups: HashMap<GroupKey, Arc<ProcessGroup>>,
    next_id: GroupId,
}

/// Process-wide cache of communication groups.
///
/// Requesting the same ordered rank list and kind twice yields the same [`ProcessGroup`].
/// Creation is serialized by a lock, so two threads of one process asking for the same key
/// observe a single group. Group `0` is reserved for the world group and never handed out.
#[derive(Debug)]
pub struct ProcessGroupRegistry {
    state: Mutex<RegistryState>,
}

impl Default for ProcessGroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroupRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                groups: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Returns the group for `ranks` and `group_type`, creating it on first request.
    pub fn get_or_create(&self, ranks: &[ProcessId], group_type: GroupType) -> Arc<ProcessGroup> {
        let key = GroupKey {
            ranks: ranks.to_vec(),
            group_type,
        };
        let mut state = self.state.lock();

        if let Some(group) = state.groups.get(&key) {
            trace!("Reusing {} group {} for ranks {:?}", group_type, group.id, ranks);
            return group.clone();
        }

        let id = state.next_id;
        state.next_id += 1;
        let group = Arc::new(ProcessGroup {
            id,
            ranks: key.ranks.clone(),
            group_type,
        });
        debug!("Created {} group {} for ranks {:?}", group_type, id, ranks);
        state.groups.insert(key, group.clone());
        group
    }

    /// Returns the group for `ranks` and `group_type` if it was already created.
    pub fn get(&self, ranks: &[ProcessId], group_type: GroupType) -> Option<Arc<ProcessGroup>> {
        let key = GroupKey {
            ranks: ranks.to_vec(),
            group_type,
        };
        self.state.lock().groups.get(&key).cloned()
    }

    /// All groups created so far, ordered by id.
    pub fn groups(&self) -> Vec<Arc<ProcessGroup>> {
        let mut groups: Vec<_> = self.state.lock().groups.values().cloned().collect();
        groups.sort_by_key(|group| group.id);
        groups
    }

    /// Number of groups created so far.
    pub fn len(&self) -> usize {
        self.state.lock().groups.len()
    }

    /// Whether no group was created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = ProcessGroupRegistry::new();

        let first = registry.get_or_create(&[0, 2], GroupType::P2P);
        let second = registry.get_or_create(&[0, 2], GroupType::P2P);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_group_order_is_significant() {
        let registry = ProcessGroupRegistry::new();

        let forward = registry.get_or_create(&[0, 2], GroupType::P2P);
        let reverse = registry.get_or_create(&[2, 0], GroupType::P2P);

        assert!(!Arc::ptr_eq(&forward, &reverse));
        assert_ne!(forward.id(), reverse.id());
        assert_eq!(forward.local_rank(2), Some(1));
        assert_eq!(reverse.local_rank(2), Some(0));
    }

    #[test]
    fn test_group_type_is_part_of_the_key() {
        let registry = ProcessGroupRegistry::new();

        let p2p = registry.get_or_create(&[0, 1], GroupType::P2P);
        let collective = registry.get_or_create(&[0, 1], GroupType::Collective);

        assert_ne!(p2p.id(), collective.id());
        assert!(registry.get(&[0, 1], GroupType::P2P).is_some());
        assert!(registry.get(&[1, 0], GroupType::P2P).is_none());
    }

    #[test]
    fn test_ids_start_after_world_group() {
        let registry = ProcessGroupRegistry::new();
        assert!(registry.is_empty());

        registry.get_or_create(&[3, 1], GroupType::P2P);
        registry.get_or_create(&[1, 3], GroupType::P2P);

        let ids: Vec<_> = registry.groups().iter().map(|g| g.id()).collect();
        assert_eq!(ids, alloc::vec![1, 2]);
    }

    #[test]
    fn test_concurrent_requests_create_one_group() {
        let registry = Arc::new(ProcessGroupRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_or_create(&[4, 5], GroupType::P2P).id())
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|&id| id == ids[0]));
        assert_eq!(registry.len(), 1);
    }
}
