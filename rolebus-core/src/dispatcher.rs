//! The Protocol Dispatcher: decodes packets addressed to the role-manager
//! service and routes them to the Registry/Binder/Enumeration Streamer.

use crate::binder;
use crate::collab::{DeviceBus, Pipe, ServiceKey};
use crate::enumerate::EnumCursor;
use crate::registry::{Binding, RoleId, RoleRegistry};
use num_traits::FromPrimitive;
use rolebus_abi::{RoleBusError, RoleManagerCmd, RoleManagerReg, SetRoleHeader};
use zerocopy::FromBytes;

/// What the dispatcher did with a command packet. `RegisterIo` means the
/// command was not one of the three role-manager opcodes; it is register
/// traffic for [`read_register`]/[`write_register`] (or, for an unknown
/// register, for whatever generic register-handling layer sits above this
/// crate).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    RegisterIo,
}

/// Routes one command packet addressed to the role-manager service.
/// `pipe` is only consulted for `LIST_ROLES` -- the caller is expected to
/// have already opened it from the command packet only when the opcode
/// demands it (opening itself is out of this crate's scope).
///
/// Asserts `registry.locked == false` on entry: the dispatcher never
/// itself runs under the binder's reentrancy guard.
pub fn handle_command<B: DeviceBus>(
    registry: &mut RoleRegistry,
    bus: &mut B,
    enum_cursor: &mut EnumCursor,
    pipe: Option<Box<dyn Pipe>>,
    on_role_changed: impl FnMut(RoleId),
    command: u16,
    payload: &[u8],
) -> Result<Outcome, RoleBusError> {
    assert!(!registry.locked, "dispatcher entry while binder is locked");

    match RoleManagerCmd::from_u16(command) {
        Some(RoleManagerCmd::ClearAllRoles) => {
            clear_all_roles(registry, bus, on_role_changed);
            Ok(Outcome::Handled)
        }
        Some(RoleManagerCmd::SetRole) => {
            set_role(registry, bus, on_role_changed, payload)?;
            Ok(Outcome::Handled)
        }
        Some(RoleManagerCmd::ListRoles) => {
            let pipe = pipe.expect("LIST_ROLES dispatched without an opened pipe");
            enum_cursor.begin_list(registry, pipe);
            Ok(Outcome::Handled)
        }
        None => {
            registry.recompute_all_roles_allocated();
            Ok(Outcome::RegisterIo)
        }
    }
}

fn clear_all_roles<B: DeviceBus>(
    registry: &mut RoleRegistry,
    bus: &mut B,
    mut on_role_changed: impl FnMut(RoleId),
) {
    let all: Vec<RoleId> = registry.roles().iter().map(|r| r.id).collect();
    for role in all {
        binder::set(registry, bus, role, None, &mut on_role_changed);
    }
}

fn set_role<B: DeviceBus>(
    registry: &mut RoleRegistry,
    bus: &mut B,
    mut on_role_changed: impl FnMut(RoleId),
    payload: &[u8],
) -> Result<(), RoleBusError> {
    let (header, name) =
        SetRoleHeader::read_from_prefix(payload).map_err(|_| RoleBusError::BadPacket)?;

    let Some(role) = registry.lookup_by_name_bytes(name) else {
        return Ok(()); // unknown name: silent drop, matching the source.
    };

    let target = if header.device_id == 0 {
        None
    } else {
        let key = ServiceKey {
            device_id: header.device_id,
            service_index: header.service_idx,
        };
        match bus.find_service(key) {
            Some(_) => Some(Binding {
                device_id: header.device_id,
                service_index: header.service_idx,
            }),
            None => return Ok(()), // unknown device/service: silent drop.
        }
    };

    binder::set(registry, bus, role, target, &mut on_role_changed);
    Ok(())
}

/// Reads one of the two registers this service exposes. `None` if `reg` is
/// not one of this service's own registers (generic register dispatch
/// beyond that is out of scope).
pub fn read_register(registry: &RoleRegistry, reg: u16) -> Option<u8> {
    match RoleManagerReg::from_u16(reg)? {
        RoleManagerReg::AutoBind => Some(registry.auto_bind_enabled as u8),
        RoleManagerReg::AllRolesAllocated => Some(registry.all_roles_allocated as u8),
    }
}

/// Writes `AUTO_BIND`; a no-op for `ALL_ROLES_ALLOCATED` (read-only) or any
/// register this service does not own.
pub fn write_register(registry: &mut RoleRegistry, reg: u16, value: u8) {
    if let Some(RoleManagerReg::AutoBind) = RoleManagerReg::from_u16(reg) {
        registry.auto_bind_enabled = value != 0;
    }
}
