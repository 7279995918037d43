//! `RoleManager`: the aggregate tying the Registry, Binder, Enumeration
//! Streamer, Protocol Dispatcher, Register Cache, and Fiber/Bus Bridge
//! together into the single process-wide object the source models as a
//! `_state` singleton.

use crate::binder;
use crate::bridge::{FiberBusBridge, FiberId, GetRegisterOutcome, Packet, SendCmdOutcome, ShouldRun};
use crate::collab::{BusSink, Clock, DeviceBus, Pipe, Scheduler, StringTable};
use crate::dispatcher;
use crate::enumerate::EnumCursor;
use crate::registry::{RoleId, RoleRegistry};
use ringbuf::*;
use rolebus_abi::RoleBusError;

pub use crate::binder::AUTOBIND_PERIOD_MS;

/// Period of the `CHANGE` event coalescing timer.
pub const CHANGE_EVENT_PERIOD_MS: u64 = 50;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    RoleAllocated(RoleId),
    RoleFreed(RoleId),
    FreedAll,
    AutobindPass,
    DeviceDestroyed(u64),
    ChangeEventEmitted,
    CommandBadPacket,
    RegisterIo(u16),
    None,
}

ringbuf!(Trace, 32, Trace::None);

/// Per-allocation-order-stable aggregate. Owned by the hosting dispatch
/// loop as an explicit value, never as mutable ambient/global state.
pub struct RoleManager {
    registry: RoleRegistry,
    cursor: EnumCursor,
    bridge: FiberBusBridge,
    next_autobind_ms: u64,
    next_change_ms: u64,
}

impl RoleManager {
    /// `now_ms` is the monotonic clock reading at construction time; both
    /// periodic timers are scheduled one full period out, matching the
    /// source's `next_autobind = now + AUTOBIND_MS * 1000`.
    pub fn new(now_ms: u64) -> Self {
        Self {
            registry: RoleRegistry::new(),
            cursor: EnumCursor::new(),
            bridge: FiberBusBridge::new(),
            next_autobind_ms: now_ms + AUTOBIND_PERIOD_MS,
            next_change_ms: now_ms + CHANGE_EVENT_PERIOD_MS,
        }
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    pub fn packet(&self) -> &Packet {
        self.bridge.packet()
    }

    /// Allocates a role, aborting any in-flight `LIST_ROLES` enumeration
    /// first: allocation invalidates a streaming cursor.
    pub fn allocate_role(&mut self, name: &str, service_class: u32) -> RoleId {
        self.cursor.stop_list();
        let id = self.registry.allocate(name, service_class);
        ringbuf_entry!(Trace::RoleAllocated(id));
        id
    }

    pub fn allocate_hidden_role(&mut self, name: &str, service_class: u32) -> RoleId {
        self.cursor.stop_list();
        let id = self.registry.allocate_hidden(name, service_class);
        ringbuf_entry!(Trace::RoleAllocated(id));
        id
    }

    /// Registers a fiber with the Bridge for `role`.
    pub fn register_fiber(&mut self, role: RoleId) -> FiberId {
        self.bridge.register_fiber(role)
    }

    /// Clears `role`'s binding and removes it from the registry. Fatal if
    /// `role` is not present.
    pub fn free_role<B: DeviceBus, S: Scheduler>(&mut self, bus: &mut B, scheduler: &mut S, role: RoleId) {
        self.cursor.stop_list();
        assert!(!self.registry.locked, "nested binder entry");
        self.registry.locked = true;
        {
            let bridge = &mut self.bridge;
            binder::set(&mut self.registry, bus, role, None, |r| bridge.role_changed(scheduler, r));
        }
        self.registry.locked = false;
        self.registry.unlink(role);
        ringbuf_entry!(Trace::RoleFreed(role));
    }

    /// Clears every binding, then removes every role.
    pub fn free_all<B: DeviceBus, S: Scheduler>(&mut self, bus: &mut B, scheduler: &mut S) {
        self.cursor.stop_list();
        assert!(!self.registry.locked, "nested binder entry");
        self.registry.locked = true;
        let all: Vec<RoleId> = self.registry.roles().iter().map(|r| r.id).collect();
        {
            let bridge = &mut self.bridge;
            for role in &all {
                binder::set(&mut self.registry, bus, *role, None, |r| bridge.role_changed(scheduler, r));
            }
        }
        self.registry.locked = false;
        for role in all {
            self.registry.unlink(role);
        }
        self.registry.changed = true;
        ringbuf_entry!(Trace::FreedAll);
    }

    /// Unbinds every role bound to a service of `device_id`.
    pub fn on_device_destroyed<B: DeviceBus, S: Scheduler>(&mut self, bus: &mut B, scheduler: &mut S, device_id: u64) {
        let bridge = &mut self.bridge;
        binder::on_device_destroyed(&mut self.registry, bus, device_id, |r| bridge.role_changed(scheduler, r));
        ringbuf_entry!(Trace::DeviceDestroyed(device_id));
    }

    fn run_autobind<B: DeviceBus, S: Scheduler>(&mut self, bus: &mut B, scheduler: &mut S) {
        let bridge = &mut self.bridge;
        binder::autobind_pass(&mut self.registry, bus, |r| bridge.role_changed(scheduler, r));
        ringbuf_entry!(Trace::AutobindPass);
    }

    /// Advances the enumeration cursor and the two periodic timers by one
    /// scheduler tick. Returns `true` exactly on a tick where a `CHANGE`
    /// event should be emitted -- sending it is the caller's job, since
    /// the physical transport lives outside this crate.
    pub fn tick<B: DeviceBus, S: Scheduler>(&mut self, now_ms: u64, bus: &mut B, scheduler: &mut S) -> bool {
        self.cursor.tick(&self.registry);

        if should_sample(&mut self.next_autobind_ms, now_ms, AUTOBIND_PERIOD_MS) {
            self.run_autobind(bus, scheduler);
        }

        if should_sample(&mut self.next_change_ms, now_ms, CHANGE_EVENT_PERIOD_MS) && self.registry.changed {
            self.registry.changed = false;
            ringbuf_entry!(Trace::ChangeEventEmitted);
            return true;
        }

        false
    }

    /// Routes a command packet addressed to the role-manager service.
    pub fn handle_command<B: DeviceBus, S: Scheduler>(
        &mut self,
        bus: &mut B,
        scheduler: &mut S,
        pipe: Option<Box<dyn Pipe>>,
        command: u16,
        payload: &[u8],
    ) -> Result<dispatcher::Outcome, RoleBusError> {
        let bridge = &mut self.bridge;
        let result = dispatcher::handle_command(
            &mut self.registry,
            bus,
            &mut self.cursor,
            pipe,
            |r| bridge.role_changed(scheduler, r),
            command,
            payload,
        );
        if result.is_err() {
            ringbuf_entry!(Trace::CommandBadPacket);
        }
        result
    }

    pub fn read_register(&self, reg: u16) -> Option<u8> {
        ringbuf_entry!(Trace::RegisterIo(reg));
        dispatcher::read_register(&self.registry, reg)
    }

    pub fn write_register(&mut self, reg: u16, value: u8) {
        ringbuf_entry!(Trace::RegisterIo(reg));
        dispatcher::write_register(&mut self.registry, reg, value);
    }

    pub fn get_register(
        &mut self,
        fiber: FiberId,
        role: RoleId,
        command: u16,
        timeout_ms: u64,
        arg: u32,
        now_ms: u64,
    ) -> GetRegisterOutcome {
        self.bridge.get_register(&self.registry, fiber, role, command, timeout_ms, arg, now_ms)
    }

    pub fn send_cmd<S: Scheduler>(&mut self, scheduler: &mut S, fiber: FiberId, role: RoleId, command: u16, now_ms: u64) -> SendCmdOutcome {
        self.bridge.send_cmd(&self.registry, scheduler, fiber, role, command, now_ms)
    }

    pub fn should_run<B: BusSink>(&mut self, bus: &mut B, strings: &impl StringTable, fiber: FiberId, now_ms: u64) -> ShouldRun {
        self.bridge.should_run(&self.registry, bus, strings, fiber, now_ms)
    }

    pub fn process_pkt<S: Scheduler>(&mut self, strings: &impl StringTable, scheduler: &mut S, pkt: Packet, now_ms: u64) {
        self.bridge.process_pkt(&self.registry, strings, scheduler, pkt, now_ms);
    }

    /// Convenience wrapper reading `now_ms` from `clock` before ticking.
    pub fn tick_with_clock<B: DeviceBus, S: Scheduler>(&mut self, clock: &impl Clock, bus: &mut B, scheduler: &mut S) -> bool {
        self.tick(clock.now_ms(), bus, scheduler)
    }
}

/// Periodic-sample helper: a pure free function over a caller-owned cursor
/// rather than a trait method, since the whole operation is stateless
/// given `now` and `&mut next_due`.
fn should_sample(next_due: &mut u64, now_ms: u64, period_ms: u64) -> bool {
    if now_ms >= *next_due {
        *next_due = now_ms + period_ms;
        true
    } else {
        false
    }
}
