//! The Role Registry: an ordered set of roles keyed by name.

use crate::collab::ServiceKey;

/// Stable per-allocation identity for a role. Distinct from the role's
/// position in the sorted-by-name sequence -- the script runtime and the
/// Fiber/Bus Bridge address roles by this id, matching the source's
/// `ctx->roles[role_idx]` allocation-order array.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoleId(pub u32);

/// A bound service endpoint, addressed weakly by key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub device_id: u64,
    pub service_index: u8,
}

impl Binding {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            device_id: self.device_id,
            service_index: self.service_index,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub service_class: u32,
    pub hidden: bool,
    pub binding: Option<Binding>,
}

/// The ordered role sequence plus the registry's scalar state. The
/// enumeration cursor and autobind/change timers live in
/// [`crate::enumerate::EnumCursor`] and
/// [`crate::manager::RoleManager`] respectively, to keep this module
/// focused on the role sequence itself.
pub struct RoleRegistry {
    roles: Vec<Role>,
    next_id: u32,
    pub auto_bind_enabled: bool,
    pub all_roles_allocated: bool,
    pub changed: bool,
    /// Assertion-only reentrancy guard; never used as an actual lock.
    /// True only for the duration of a binder bulk pass.
    pub locked: bool,
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self {
            roles: Vec::new(),
            next_id: 0,
            auto_bind_enabled: true,
            all_roles_allocated: false,
            changed: false,
            locked: false,
        }
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn role(&self, id: RoleId) -> Option<&Role> {
        self.roles.iter().find(|r| r.id == id)
    }

    pub fn role_mut(&mut self, id: RoleId) -> Option<&mut Role> {
        self.roles.iter_mut().find(|r| r.id == id)
    }

    fn find_by_name(&self, name: &str) -> Result<usize, usize> {
        self.roles.binary_search_by(|r| r.name.as_str().cmp(name))
    }

    /// Look up a role by raw name bytes, as they arrive in a `SET_ROLE`
    /// packet (no terminator, not necessarily valid UTF-8 in principle --
    /// role names are ASCII identifiers in practice, matching the
    /// source's `memcmp`).
    pub fn lookup_by_name_bytes(&self, name: &[u8]) -> Option<RoleId> {
        self.roles
            .iter()
            .find(|r| r.name.as_bytes() == name)
            .map(|r| r.id)
    }

    pub fn lookup_by_service(&self, key: ServiceKey) -> Option<RoleId> {
        self.roles
            .iter()
            .find(|r| r.binding.map(|b| b.key()) == Some(key))
            .map(|r| r.id)
    }

    /// Allocates a role with `(name, service_class)`, inserting it into
    /// the ascending-by-name sequence. Fatal (panics) if the name is
    /// already registered -- this is a programmer error, not a
    /// recoverable condition.
    pub fn allocate(&mut self, name: &str, service_class: u32) -> RoleId {
        if self.find_by_name(name).is_ok() {
            panic!("role `{name}` already registered");
        }
        let id = RoleId(self.next_id);
        self.next_id += 1;
        let insert_at = self.find_by_name(name).unwrap_err();
        self.roles.insert(
            insert_at,
            Role {
                id,
                name: name.to_string(),
                service_class,
                hidden: false,
                binding: None,
            },
        );
        self.changed = true;
        id
    }

    /// Allocates a hidden role (skipped by enumeration, bound and
    /// dispatched normally otherwise). Not named as a separate source
    /// operation, but `Role::hidden` needs to be settable somewhere;
    /// this is the natural seam.
    pub fn allocate_hidden(&mut self, name: &str, service_class: u32) -> RoleId {
        let id = self.allocate(name, service_class);
        self.role_mut(id).unwrap().hidden = true;
        id
    }

    /// Removes a role from the sequence. The caller must have already
    /// cleared its binding (see `RoleManager::free_role`, which wraps
    /// this with the binder's clear path under the reentrancy guard).
    /// Fatal if the role is not present.
    pub fn unlink(&mut self, id: RoleId) -> Role {
        let idx = self
            .roles
            .iter()
            .position(|r| r.id == id)
            .unwrap_or_else(|| panic!("free of unregistered role {id:?}"));
        self.roles.remove(idx)
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn recompute_all_roles_allocated(&mut self) {
        self.all_roles_allocated = self.roles.iter().all(|r| r.binding.is_some());
    }
}
