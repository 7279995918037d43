//! Wire types for the role-manager service.
//!
//! Opcode and register numbers below are placeholders for the values
//! defined by the service's canonical schema (not part of this crate's
//! inputs); the wire *layout* of each record is what must be bit-exact,
//! and that layout is what the `zerocopy` types here encode.

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Service class tag under which the role manager registers.
pub const SERVICE_CLASS_ROLE_MANAGER: u32 = 0x_6ebf_e27a;

/// Pseudo service class used by the script runtime to model a condition
/// variable over the bus: a role bound to this class is never actually
/// bound to a device service. `send_cmd` on such a role broadcasts a wake
/// to every fiber waiting on it instead of transmitting a packet.
pub const SERVICE_CLASS_JACSCRIPT_CONDITION: u32 = 0x_1a0d_6ab2;

/// Generic register-command encoding shared by every jacdac service (out
/// of scope as a "service-register handling helper", but the Fiber/Bus
/// Bridge needs these two bits to decide whether a `send_cmd` is a
/// register write that should invalidate a cached read).
pub const CMD_GET_REGISTER: u16 = 0x1000;
pub const CMD_SET_REGISTER: u16 = 0x2000;
const CMD_REGISTER_CODE_MASK: u16 = 0x0fff;

/// True if `command` is a register-set command under the generic
/// register-command encoding.
pub const fn is_set_register(command: u16) -> bool {
    command & CMD_SET_REGISTER != 0
}

/// The get-register command that reads back what `command` (a
/// register-set command) writes.
pub const fn as_get_register(command: u16) -> u16 {
    (command & CMD_REGISTER_CODE_MASK) | CMD_GET_REGISTER
}

bitflags! {
    /// Flags carried on a device-service endpoint. The core reads and
    /// writes only `ROLE_ASSIGNED`; other bits belong to the device
    /// subsystem.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ServiceFlags: u32 {
        const ROLE_ASSIGNED = 1 << 0;
    }
}

/// Commands understood by the role-manager service.
#[derive(Copy, Clone, Debug, FromPrimitive, ToPrimitive, PartialEq, Eq)]
#[repr(u16)]
pub enum RoleManagerCmd {
    ClearAllRoles = 0x80,
    SetRole = 0x81,
    ListRoles = 0x82,
}

/// Registers exposed by the role-manager service.
#[derive(Copy, Clone, Debug, FromPrimitive, ToPrimitive, PartialEq, Eq)]
#[repr(u16)]
pub enum RoleManagerReg {
    AutoBind = 0x80,
    AllRolesAllocated = 0x81,
}

/// Events emitted by the role-manager service.
#[derive(Copy, Clone, Debug, FromPrimitive, ToPrimitive, PartialEq, Eq)]
#[repr(u16)]
pub enum RoleManagerEvent {
    Change = 0x03,
}

/// `SET_ROLE` command body: `{device_id, service_idx, pad, service_class}`
/// followed by the role name bytes (not part of this fixed struct; the
/// caller slices them off the remainder of the packet payload).
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SetRoleHeader {
    pub device_id: u64,
    pub service_idx: u8,
    pub pad: [u8; 3],
    pub service_class: u32,
}

impl SetRoleHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// One `LIST_ROLES` response record, sans trailing name bytes. Identical
/// layout to [`SetRoleHeader`] (both are the `role_manager_roles` wire
/// record), kept as a distinct type since the two are logically different
/// messages.
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RoleRecordHeader {
    pub device_id: u64,
    pub service_idx: u8,
    pub pad: [u8; 3],
    pub service_class: u32,
}

impl RoleRecordHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub const fn unbound(service_class: u32) -> Self {
        Self {
            device_id: 0,
            service_idx: 0,
            pad: [0; 3],
            service_class,
        }
    }
}

/// Errors the core can report back across a process boundary. Programmer
/// errors (broken invariants) are not part of this type -- they are
/// `panic!`s, not `Result`s.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RoleBusError {
    #[error("pipe is not ready for more data yet")]
    TryAgain,
    #[error("pipe write failed")]
    PipeError,
    #[error("malformed command packet")]
    BadPacket,
    #[error("unknown response code")]
    BadResponse,
}

impl From<RoleBusError> for u32 {
    fn from(e: RoleBusError) -> Self {
        match e {
            RoleBusError::TryAgain => 1,
            RoleBusError::PipeError => 2,
            RoleBusError::BadPacket => 3,
            RoleBusError::BadResponse => 4,
        }
    }
}

impl From<u32> for RoleBusError {
    fn from(code: u32) -> Self {
        match code {
            1 => RoleBusError::TryAgain,
            2 => RoleBusError::PipeError,
            3 => RoleBusError::BadPacket,
            _ => RoleBusError::BadResponse,
        }
    }
}
