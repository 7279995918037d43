//! The Enumeration Streamer: a paced writer that drains the role sequence
//! over a back-pressured pipe, one `role_manager_roles` wire record per
//! visible role.

use crate::collab::{Pipe, PipeStatus};
use crate::registry::{RoleId, RoleRegistry};
use rolebus_abi::RoleRecordHeader;

/// Owned by [`crate::manager::RoleManager`]; one list request in flight at
/// a time, matching the source's single `list_pipe`/`list_ptr` pair. The
/// pipe is owned here for the lifetime of the list, the same way
/// `srv_state::list_pipe` is -- a registry mutation can close and drop it
/// at any time via `stop_list`, with no caller around to hand it back in.
pub struct EnumCursor {
    next: Option<RoleId>,
    pipe: Option<Box<dyn Pipe>>,
}

impl Default for EnumCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl EnumCursor {
    pub fn new() -> Self {
        Self { next: None, pipe: None }
    }

    pub fn is_streaming(&self) -> bool {
        self.pipe.is_some()
    }

    /// Starts a `LIST_ROLES` response: positions the cursor at the first
    /// visible role, closing the pipe immediately if the registry holds
    /// none.
    pub fn begin_list(&mut self, registry: &RoleRegistry, mut pipe: Box<dyn Pipe>) {
        match first_visible(registry, None) {
            None => pipe.close(),
            Some(role) => {
                self.next = Some(role);
                self.pipe = Some(pipe);
            }
        }
    }

    /// Any registry mutation that can invalidate role ordering or
    /// identity forces the cursor back to idle and closes the pipe, so a
    /// stale record is never emitted.
    pub fn stop_list(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            pipe.close();
        }
        self.next = None;
    }

    /// One scheduler tick: writes as many records as the pipe has space
    /// for, stopping on back-pressure (`TRY_AGAIN`, retried next tick) or
    /// a pipe error (enumeration abandoned).
    pub fn tick(&mut self, registry: &RoleRegistry) {
        while let Some(role_id) = self.next {
            let Some(pipe) = self.pipe.as_mut() else { return };

            let Some(role) = registry.role(role_id) else {
                // The role vanished mid-stream; treat like end-of-list.
                self.stop_list();
                return;
            };

            let name = role.name.as_bytes();
            let size = RoleRecordHeader::SIZE + name.len();
            match pipe.check_space(size) {
                PipeStatus::TryAgain => return,
                PipeStatus::Error => {
                    self.stop_list();
                    return;
                }
                PipeStatus::Ok => {}
            }

            let header = match role.binding {
                Some(b) => RoleRecordHeader {
                    device_id: b.device_id,
                    service_idx: b.service_index,
                    pad: [0; 3],
                    service_class: role.service_class,
                },
                None => RoleRecordHeader::unbound(role.service_class),
            };
            pipe.write(zerocopy::IntoBytes::as_bytes(&header));
            pipe.write(name);

            self.next = first_visible(registry, Some(role_id));
            if self.next.is_none() {
                self.stop_list();
            }
        }
    }
}

/// The first non-hidden role strictly after `after` in registry order, or
/// the first non-hidden role overall if `after` is `None`.
fn first_visible(registry: &RoleRegistry, after: Option<RoleId>) -> Option<RoleId> {
    let roles = registry.roles();
    let start = match after {
        None => 0,
        Some(id) => roles.iter().position(|r| r.id == id).map(|i| i + 1).unwrap_or(roles.len()),
    };
    roles[start..].iter().find(|r| !r.hidden).map(|r| r.id)
}
