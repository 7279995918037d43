//! The Binder: assigns services to roles and runs the periodic autobind
//! policy.

use crate::collab::{DeviceBus, ServiceKey};
use crate::registry::{Binding, RoleId, RoleRegistry};

/// Autobind period, measured from registry init plus one full period
/// (the source waits a full `AUTOBIND_MS` before the first pass).
pub const AUTOBIND_PERIOD_MS: u64 = 980;

/// Binds or unbinds a single role, flipping `ROLE_ASSIGNED` on the old
/// and new service in turn and notifying `on_role_changed`. A no-op if
/// `target` already equals the role's current binding (this is what
/// makes `set(r, s); set(r, s)` idempotent -- the second call never
/// reaches the notification).
///
/// Panics if `locked` is already true and the caller is not one of the
/// bulk-mutation entry points that itself manages the guard (autobind,
/// free, free_all, device-destroyed) -- callers of `set` from those
/// sites are expected to have raised `registry.locked` first.
pub fn set<B: DeviceBus>(
    registry: &mut RoleRegistry,
    bus: &mut B,
    role: RoleId,
    target: Option<Binding>,
    mut on_role_changed: impl FnMut(RoleId),
) {
    let current = registry.role(role).expect("set on unknown role").binding;
    if current == target {
        return;
    }

    // Clear-then-set, sequentially, matching the source: the old
    // service's flag is cleared before the new one's is set, even if an
    // allocator could in principle reuse the same slot between the two.
    if let Some(old) = current {
        bus.set_role_assigned(old.key(), false);
    }
    if let Some(new) = target {
        bus.set_role_assigned(new.key(), true);
    }

    registry.role_mut(role).unwrap().binding = target;
    registry.changed = true;
    on_role_changed(role);
}

/// Runs one autobind pass: for every unbound, non-hidden role, binds the
/// first free service endpoint whose class matches. Raises `locked`
/// around the whole pass to catch reentrant binder mutation. A no-op if
/// autobind is disabled.
pub fn autobind_pass<B: DeviceBus>(
    registry: &mut RoleRegistry,
    bus: &mut B,
    mut on_role_changed: impl FnMut(RoleId),
) {
    if !registry.auto_bind_enabled {
        return;
    }

    assert!(!registry.locked, "nested binder entry");
    registry.locked = true;

    let unbound: Vec<(RoleId, u32)> = registry
        .roles()
        .iter()
        .filter(|r| r.binding.is_none())
        .map(|r| (r.id, r.service_class))
        .collect();

    for (role, class) in unbound {
        let services = bus.scan_services();
        if let Some(view) = services
            .iter()
            .find(|v| v.service_class == class && !v.flags.contains(rolebus_abi::ServiceFlags::ROLE_ASSIGNED))
        {
            let binding = Binding {
                device_id: view.key.device_id,
                service_index: view.key.service_index,
            };
            set(registry, bus, role, Some(binding), &mut on_role_changed);
        }
    }

    registry.locked = false;
}

/// Unbinds every role whose bound service belonged to `device_id`. Runs
/// under the reentrancy guard, matching the source's
/// `rolemgr_device_destroyed`.
pub fn on_device_destroyed<B: DeviceBus>(
    registry: &mut RoleRegistry,
    bus: &mut B,
    device_id: u64,
    mut on_role_changed: impl FnMut(RoleId),
) {
    assert!(!registry.locked, "nested binder entry");
    registry.locked = true;

    let affected: Vec<RoleId> = registry
        .roles()
        .iter()
        .filter(|r| r.binding.is_some_and(|b| b.device_id == device_id))
        .map(|r| r.id)
        .collect();

    for role in affected {
        set(registry, bus, role, None, &mut on_role_changed);
    }

    registry.locked = false;
}
