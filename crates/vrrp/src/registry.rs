//! Instance and sync-group registries (spec §3, §9 design note).
//!
//! `VirtualRouterId`/`SyncGroupId` are plain indices into these `Vec`s, not
//! pointers — a `SyncGroup` never holds anything but ids, so the coordinator
//! and FSM can freely borrow one side while mutating the other.

use crate::types::{SyncGroup, SyncGroupId, VirtualRouter, VirtualRouterId};

/// Owns every configured virtual router. Ids are stable for the registry's
/// whole lifetime: nothing ever removes an entry from the backing `Vec`, so
/// a `VirtualRouterId` handed out once stays valid everywhere it was
/// recorded. `Scheduler::reload` represents a dropped instance by flipping
/// its `VirtualRouter::retired` flag rather than compacting the `Vec`.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: Vec<VirtualRouter>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self { instances: Vec::new() }
    }

    /// Insert a new instance. `build` receives the id it will be assigned
    /// so the constructed `VirtualRouter` can carry it.
    pub fn insert(&mut self, build: impl FnOnce(VirtualRouterId) -> VirtualRouter) -> VirtualRouterId {
        let id = VirtualRouterId(self.instances.len() as u32);
        self.instances.push(build(id));
        id
    }

    pub fn get(&self, id: VirtualRouterId) -> &VirtualRouter {
        &self.instances[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: VirtualRouterId) -> &mut VirtualRouter {
        &mut self.instances[id.0 as usize]
    }

    pub fn try_get(&self, id: VirtualRouterId) -> Option<&VirtualRouter> {
        self.instances.get(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualRouter> {
        self.instances.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = VirtualRouterId> + '_ {
        (0..self.instances.len()).map(|i| VirtualRouterId(i as u32))
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn find_by_name(&self, name: &str) -> Option<VirtualRouterId> {
        self.instances
            .iter()
            .find(|vr| vr.name == name)
            .map(|vr| vr.id)
    }

    /// Iterate every configured instance's name, in registry order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.instances.iter().map(|vr| vr.name.as_str())
    }
}

/// Owns every configured sync group.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: Vec<SyncGroup>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self { groups: Vec::new() }
    }

    pub fn insert(&mut self, build: impl FnOnce(SyncGroupId) -> SyncGroup) -> SyncGroupId {
        let id = SyncGroupId(self.groups.len() as u32);
        self.groups.push(build(id));
        id
    }

    pub fn get(&self, id: SyncGroupId) -> &SyncGroup {
        &self.groups[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: SyncGroupId) -> &mut SyncGroup {
        &mut self.groups[id.0 as usize]
    }

    pub fn find_by_name(&self, name: &str) -> Option<SyncGroupId> {
        self.groups.iter().find(|g| g.name == name).map(|g| g.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncGroup> {
        self.groups.iter()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicInstant;
    use crate::types::{AddressFamily, VRRP_VERSION_V3};

    fn make_router(id: VirtualRouterId, name: &str) -> VirtualRouter {
        VirtualRouter::new(
            id,
            name,
            1,
            VRRP_VERSION_V3,
            AddressFamily::V4,
            "eth0",
            100,
            100,
            "10.0.0.1".parse().unwrap(),
            vec!["10.0.0.100".parse().unwrap()],
            true,
            false,
            MonotonicInstant::ZERO,
        )
    }

    #[test]
    fn insert_assigns_sequential_ids() {
        let mut reg = InstanceRegistry::new();
        let a = reg.insert(|id| make_router(id, "a"));
        let b = reg.insert(|id| make_router(id, "b"));
        assert_eq!(a, VirtualRouterId(0));
        assert_eq!(b, VirtualRouterId(1));
        assert_eq!(reg.get(a).name, "a");
        assert_eq!(reg.get(b).name, "b");
    }

    #[test]
    fn find_by_name_resolves_existing_instance() {
        let mut reg = InstanceRegistry::new();
        reg.insert(|id| make_router(id, "vr1"));
        assert_eq!(reg.find_by_name("vr1"), Some(VirtualRouterId(0)));
        assert_eq!(reg.find_by_name("missing"), None);
    }

    #[test]
    fn group_registry_round_trips() {
        let mut groups = GroupRegistry::new();
        let id = groups.insert(|id| SyncGroup::new(id, "g1"));
        assert_eq!(groups.find_by_name("g1"), Some(id));
        assert_eq!(groups.get(id).name, "g1");
    }
}
