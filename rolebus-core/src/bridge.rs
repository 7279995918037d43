//! The Fiber/Bus Bridge: lets the script runtime read registers, send
//! commands, and await events over the bus, backed by the Register Cache
//! and a per-fiber resend/timeout state machine.

use crate::cache::{RegisterCache, CHANGE_AGE_MS, MAX_REG_VALIDITY_MS};
use crate::collab::{BusSink, Scheduler, StringTable};
use crate::registry::{Binding, RoleId, RoleRegistry};
use rolebus_abi::{RoleManagerEvent, SERVICE_CLASS_JACSCRIPT_CONDITION};

/// Initial resend timeout for a freshly-parked fiber; doubles on every
/// resend up to [`MAX_RESEND_MS`].
pub const RESEND_INITIAL_MS: u64 = 20;
pub const MAX_RESEND_MS: u64 = 1000;

/// Stable identity for a fiber's bus-op state, assigned when the script
/// runtime registers a fiber with the Bridge.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FiberId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Command,
    Report,
    Event,
}

/// A logical bus packet. Frame encoding, CRC, and physical transport are
/// out of scope here; this is the decoded shape the core reads and
/// writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub device_id: u64,
    pub service_index: u8,
    pub service_command: u16,
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl Packet {
    /// The "any" bus-addressed packet: service_index 0, command 0, no
    /// device. Used as the non-matching default, and as a wildcard device
    /// announcement shape for the matching predicate below.
    fn sentinel() -> Self {
        Self {
            device_id: u64::MAX,
            service_index: 0xff,
            service_command: 0xffff,
            kind: PacketKind::Command,
            payload: Vec::new(),
        }
    }
}

/// The subset of fiber state the Bridge owns.
#[derive(Clone, Debug)]
struct FiberState {
    role_idx: RoleId,
    /// 0 when the fiber is not waiting on a bus op.
    service_command: u16,
    command_arg: u32,
    payload: Option<Vec<u8>>,
    resend_timeout_ms: u64,
    wake_time_ms: u64,
}

impl FiberState {
    fn idle(role_idx: RoleId) -> Self {
        Self {
            role_idx,
            service_command: 0,
            command_arg: 0,
            payload: None,
            resend_timeout_ms: RESEND_INITIAL_MS,
            wake_time_ms: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GetRegisterOutcome {
    /// A fresh cache entry existed; the shared packet buffer now holds a
    /// synthesized report and the caller can read it immediately.
    CacheHit,
    /// No usable cached value; the fiber has been parked.
    Parked,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendCmdOutcome {
    /// The fiber has been parked with an outgoing payload.
    Parked,
    /// `role_idx` is a condition-variable pseudo-role; every fiber
    /// waiting on it has been woken. The caller is expected to now yield
    /// the current fiber itself (scheduling is out of this crate's
    /// scope).
    ConditionBroadcast,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShouldRun {
    ResumeUserCode,
    KeepWaiting,
}

fn packet_matches_role(pkt: &Packet, binding: Binding) -> bool {
    pkt.device_id == binding.device_id
        && ((pkt.service_index == 0 && pkt.service_command == 0)
            || pkt.service_index == binding.service_index)
}

/// Owns the shared packet buffer and the register cache -- both are
/// Bridge-exclusive. Fibers are addressed by [`FiberId`]; the script
/// runtime registers one with [`FiberBusBridge::register_fiber`] before
/// issuing any bus op on its behalf.
pub struct FiberBusBridge {
    packet: Packet,
    cache: RegisterCache,
    fibers: Vec<(FiberId, FiberState)>,
    next_fiber_id: u32,
}

impl Default for FiberBusBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberBusBridge {
    pub fn new() -> Self {
        Self {
            packet: Packet::sentinel(),
            cache: RegisterCache::new(),
            fibers: Vec::new(),
            next_fiber_id: 0,
        }
    }

    pub fn register_fiber(&mut self, role_idx: RoleId) -> FiberId {
        let id = FiberId(self.next_fiber_id);
        self.next_fiber_id += 1;
        self.fibers.push((id, FiberState::idle(role_idx)));
        id
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    fn fiber(&self, id: FiberId) -> &FiberState {
        &self.fibers.iter().find(|(i, _)| *i == id).expect("unknown fiber").1
    }

    fn fiber_mut(&mut self, id: FiberId) -> &mut FiberState {
        &mut self
            .fibers
            .iter_mut()
            .find(|(i, _)| *i == id)
            .expect("unknown fiber")
            .1
    }

    /// Returns a cached reply immediately if one is fresh enough, else
    /// parks the fiber.
    pub fn get_register(
        &mut self,
        registry: &RoleRegistry,
        fiber: FiberId,
        role_idx: RoleId,
        command: u16,
        timeout_ms: u64,
        arg: u32,
        now_ms: u64,
    ) -> GetRegisterOutcome {
        let binding = registry.role(role_idx).and_then(|r| r.binding);
        if let Some(binding) = binding {
            if let Some(handle) = self.cache.lookup(role_idx, command, arg) {
                let timeout = if timeout_ms == 0 || timeout_ms > MAX_REG_VALIDITY_MS {
                    MAX_REG_VALIDITY_MS
                } else {
                    timeout_ms
                };
                if self.cache.last_refresh_ms(handle) + timeout >= now_ms {
                    let handle = self.cache.mark_used(handle);
                    self.packet = Packet {
                        device_id: binding.device_id,
                        service_index: binding.service_index,
                        service_command: command,
                        kind: PacketKind::Report,
                        payload: self.cache.data(handle).to_vec(),
                    };
                    return GetRegisterOutcome::CacheHit;
                }
                self.cache.free(handle);
            }
        }

        let state = self.fiber_mut(fiber);
        state.role_idx = role_idx;
        state.service_command = command;
        state.command_arg = arg;
        state.payload = None;
        state.resend_timeout_ms = RESEND_INITIAL_MS;
        state.wake_time_ms = now_ms;
        GetRegisterOutcome::Parked
    }

    /// Register-set commands invalidate the matching cached read; the
    /// `CONDITION` pseudo-class broadcasts a wake instead of transmitting.
    pub fn send_cmd<S: Scheduler>(
        &mut self,
        registry: &RoleRegistry,
        scheduler: &mut S,
        fiber: FiberId,
        role_idx: RoleId,
        command: u16,
        now_ms: u64,
    ) -> SendCmdOutcome {
        if rolebus_abi::is_set_register(command) {
            let get_cmd = rolebus_abi::as_get_register(command);
            if let Some(handle) = self.cache.lookup(role_idx, get_cmd, 0) {
                self.cache.free(handle);
            }
        }

        if registry
            .role(role_idx)
            .is_some_and(|r| r.service_class == SERVICE_CLASS_JACSCRIPT_CONDITION)
        {
            self.wake_role(scheduler, role_idx);
            return SendCmdOutcome::ConditionBroadcast;
        }

        let payload = self.packet.payload.clone();
        let state = self.fiber_mut(fiber);
        state.role_idx = role_idx;
        state.service_command = command;
        state.command_arg = 0;
        state.payload = Some(payload);
        state.resend_timeout_ms = RESEND_INITIAL_MS;
        state.wake_time_ms = now_ms;
        SendCmdOutcome::Parked
    }

    /// Runs every fiber whose `role_idx` matches.
    /// "Running" a fiber is the script runtime's job; this only notifies
    /// the scheduler which fibers to consider.
    pub fn wake_role<S: Scheduler>(&mut self, scheduler: &mut S, role_idx: RoleId) {
        for (id, state) in &self.fibers {
            if state.role_idx == role_idx {
                scheduler.run_fiber(*id);
            }
        }
    }

    fn reg_arg_length(&self, command_arg: u32, strings: &impl StringTable) -> Option<usize> {
        let s = strings.get(command_arg);
        let slen = s.len();
        let payload = &self.packet.payload;
        if payload.len() >= slen + 1 && payload[slen] == 0 && &payload[..slen] == s {
            Some(slen + 1)
        } else {
            None
        }
    }

    /// Updates (or creates) the cache entry matching the shared packet's
    /// `(role_idx, service_command, command_arg)`, returning its handle.
    /// `None` if `command_arg` is set but doesn't match the leading bytes
    /// of the packet payload -- this is how indexed registers disambiguate.
    fn update_regcache(
        &mut self,
        role_idx: RoleId,
        command_arg: u32,
        strings: &impl StringTable,
        now_ms: u64,
    ) -> Option<crate::cache::EntryHandle> {
        let mut offset = 0;
        if command_arg != 0 {
            offset = self.reg_arg_length(command_arg, strings)?;
        }
        let command = self.packet.service_command;
        let data = self.packet.payload[offset..].to_vec();
        Some(self.cache.alloc(role_idx, command, command_arg, &data, now_ms))
    }

    /// The should-run decision: called by the scheduler for each parked
    /// fiber.
    pub fn should_run<B: BusSink>(
        &mut self,
        registry: &RoleRegistry,
        bus: &mut B,
        strings: &impl StringTable,
        fiber: FiberId,
        now_ms: u64,
    ) -> ShouldRun {
        let state = self.fiber(fiber).clone();
        if state.service_command == 0 {
            return ShouldRun::ResumeUserCode;
        }

        let Some(role) = registry.role(state.role_idx) else {
            return ShouldRun::KeepWaiting;
        };
        let Some(binding) = role.binding else {
            self.fiber_mut(fiber).wake_time_ms = 0;
            return ShouldRun::KeepWaiting;
        };

        if let Some(payload) = state.payload {
            let pkt = Packet {
                device_id: binding.device_id,
                service_index: binding.service_index,
                service_command: state.service_command,
                kind: PacketKind::Command,
                payload,
            };
            bus.send(&pkt);
            let fs = self.fiber_mut(fiber);
            fs.service_command = 0;
            fs.payload = None;
            return ShouldRun::ResumeUserCode;
        }

        if self.packet.kind == PacketKind::Report
            && self.packet.service_command != 0
            && self.packet.service_command == state.service_command
            && packet_matches_role(&self.packet, binding)
        {
            if self
                .update_regcache(state.role_idx, state.command_arg, strings, now_ms)
                .is_some()
            {
                let handle = self
                    .cache
                    .lookup(state.role_idx, state.service_command, state.command_arg)
                    .unwrap();
                self.cache.mark_used(handle);
                self.fiber_mut(fiber).service_command = 0;
                return ShouldRun::ResumeUserCode;
            }
        }

        if now_ms >= state.wake_time_ms {
            let (argp, arglen) = if state.command_arg != 0 {
                let bytes = strings.get(state.command_arg);
                (bytes.to_vec(), bytes.len())
            } else {
                (Vec::new(), 0)
            };
            let _ = arglen;
            let pkt = Packet {
                device_id: binding.device_id,
                service_index: binding.service_index,
                service_command: state.service_command,
                kind: PacketKind::Command,
                payload: argp,
            };
            bus.send(&pkt);
            let fs = self.fiber_mut(fiber);
            if fs.resend_timeout_ms < MAX_RESEND_MS {
                fs.resend_timeout_ms *= 2;
            }
            fs.wake_time_ms = now_ms + fs.resend_timeout_ms;
        }

        ShouldRun::KeepWaiting
    }

    /// The global packet-ingestion entry point.
    pub fn process_pkt<S: Scheduler>(
        &mut self,
        registry: &RoleRegistry,
        strings: &impl StringTable,
        scheduler: &mut S,
        pkt: Packet,
        now_ms: u64,
    ) {
        self.packet = pkt;

        let matching: Vec<RoleId> = registry
            .roles()
            .iter()
            .filter_map(|r| r.binding.map(|b| (r.id, b)))
            .filter(|(_, b)| packet_matches_role(&self.packet, *b))
            .map(|(id, _)| id)
            .collect();

        for role_idx in matching {
            self.update_all_regcache(role_idx, strings, now_ms);
            self.wake_role(scheduler, role_idx);
        }

        scheduler.poke();
    }

    fn update_all_regcache(&mut self, role_idx: RoleId, strings: &impl StringTable, now_ms: u64) {
        match self.packet.kind {
            PacketKind::Command => return,
            PacketKind::Event => {
                if self.packet.service_command == RoleManagerEvent::Change as u16 {
                    self.cache.age(role_idx, now_ms.saturating_sub(CHANGE_AGE_MS));
                }
                return;
            }
            PacketKind::Report => {}
        }

        let command = self.packet.service_command;
        let mut prev = None;
        loop {
            let Some(handle) = self.cache.next(role_idx, command, prev) else {
                break;
            };
            let arg = self.cache.argument(handle);
            if self.update_regcache(role_idx, arg, strings, now_ms).is_some() {
                // Only one entry is refreshed per packet, matching upstream.
                break;
            }
            prev = Some(handle);
        }
    }

    /// Drops the role's cache, resets the shared packet buffer, and wakes
    /// every fiber on the role.
    pub fn role_changed<S: Scheduler>(&mut self, scheduler: &mut S, role_idx: RoleId) {
        self.cache.free_role(role_idx);
        self.packet = Packet::sentinel();
        self.wake_role(scheduler, role_idx);
        scheduler.poke();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeStrings(HashMap<u32, Vec<u8>>);
    impl StringTable for FakeStrings {
        fn get(&self, index: u32) -> &[u8] {
            self.0.get(&index).map(|v| v.as_slice()).unwrap_or(&[])
        }
    }

    #[derive(Default)]
    struct FakeBus {
        sent: Vec<Packet>,
    }
    impl BusSink for FakeBus {
        fn send(&mut self, packet: &Packet) {
            self.sent.push(packet.clone());
        }
    }

    #[derive(Default)]
    struct FakeScheduler {
        woken: RefCell<Vec<FiberId>>,
        pokes: RefCell<u32>,
    }
    impl Scheduler for FakeScheduler {
        fn run_fiber(&mut self, fiber: FiberId) {
            self.woken.borrow_mut().push(fiber);
        }
        fn poke(&mut self) {
            *self.pokes.borrow_mut() += 1;
        }
    }

    fn bind(reg: &mut RoleRegistry, role: RoleId, device_id: u64, service_index: u8) {
        reg.role_mut(role).unwrap().binding = Some(Binding {
            device_id,
            service_index,
        });
    }

    /// Drives the real `get_register` -> `should_run` round trip so a
    /// cache entry for `(role, command)` exists, the way it would after a
    /// fiber's first live fetch.
    fn populate_cache(
        bridge: &mut FiberBusBridge,
        reg: &RoleRegistry,
        strings: &FakeStrings,
        bus: &mut FakeBus,
        fiber: FiberId,
        role: RoleId,
        command: u16,
        device_id: u64,
        service_index: u8,
        payload: Vec<u8>,
        now_ms: u64,
    ) {
        let outcome = bridge.get_register(reg, fiber, role, command, 100, 0, now_ms);
        assert_eq!(outcome, GetRegisterOutcome::Parked);
        bridge.should_run(reg, bus, strings, fiber, now_ms); // sends the request
        bus.sent.clear();
        bridge.packet = Packet {
            device_id,
            service_index,
            service_command: command,
            kind: PacketKind::Report,
            payload,
        };
        let result = bridge.should_run(reg, bus, strings, fiber, now_ms);
        assert_eq!(result, ShouldRun::ResumeUserCode);
    }

    #[test]
    fn cache_hit_returns_immediately_without_bus_traffic() {
        let mut reg = RoleRegistry::new();
        let role = reg.allocate("thermo", 1);
        bind(&mut reg, role, 42, 3);

        let mut bridge = FiberBusBridge::new();
        let fiber = bridge.register_fiber(role);
        let strings = FakeStrings(HashMap::new());
        let mut bus = FakeBus::default();

        populate_cache(
            &mut bridge,
            &reg,
            &strings,
            &mut bus,
            fiber,
            role,
            0x101,
            42,
            3,
            vec![7, 8],
            0,
        );

        let outcome = bridge.get_register(&reg, fiber, role, 0x101, 100, 0, 50);
        assert_eq!(outcome, GetRegisterOutcome::CacheHit);
        assert_eq!(bridge.packet().payload, vec![7, 8]);
        assert!(bus.sent.is_empty());
    }

    #[test]
    fn stale_cache_entry_is_evicted_and_fiber_parks() {
        let mut reg = RoleRegistry::new();
        let role = reg.allocate("thermo", 1);
        bind(&mut reg, role, 42, 3);
        let mut bridge = FiberBusBridge::new();
        let fiber = bridge.register_fiber(role);
        let strings = FakeStrings(HashMap::new());
        let mut bus = FakeBus::default();

        populate_cache(
            &mut bridge, &reg, &strings, &mut bus, fiber, role, 0x101, 42, 3, vec![1], 0,
        );

        let outcome = bridge.get_register(&reg, fiber, role, 0x101, 10, 0, 1000);
        assert_eq!(outcome, GetRegisterOutcome::Parked);
    }

    #[test]
    fn unbound_role_parks_get_register_and_waits_indefinitely() {
        let mut reg = RoleRegistry::new();
        let role = reg.allocate("thermo", 1);
        let mut bridge = FiberBusBridge::new();
        let fiber = bridge.register_fiber(role);
        let strings = FakeStrings(HashMap::new());
        let mut bus = FakeBus::default();

        let outcome = bridge.get_register(&reg, fiber, role, 0x101, 100, 0, 0);
        assert_eq!(outcome, GetRegisterOutcome::Parked);

        let result = bridge.should_run(&reg, &mut bus, &strings, fiber, 500);
        assert_eq!(result, ShouldRun::KeepWaiting);
        assert!(bus.sent.is_empty());

        bind(&mut reg, role, 42, 3);
        let result = bridge.should_run(&reg, &mut bus, &strings, fiber, 500);
        assert_eq!(result, ShouldRun::KeepWaiting);
        assert_eq!(bus.sent.len(), 1);
        assert_eq!(bus.sent[0].device_id, 42);
    }

    #[test]
    fn send_cmd_transmits_outgoing_payload_on_next_should_run() {
        let mut reg = RoleRegistry::new();
        let role = reg.allocate("motor", 1);
        bind(&mut reg, role, 42, 3);
        let mut bridge = FiberBusBridge::new();
        let fiber = bridge.register_fiber(role);
        let strings = FakeStrings(HashMap::new());
        let mut bus = FakeBus::default();
        let mut sched = FakeScheduler::default();

        bridge.packet = Packet {
            device_id: 42,
            service_index: 3,
            service_command: 0,
            kind: PacketKind::Report,
            payload: vec![55],
        };
        let outcome = bridge.send_cmd(&reg, &mut sched, fiber, role, 0x2001, 0);
        assert_eq!(outcome, SendCmdOutcome::Parked);

        let result = bridge.should_run(&reg, &mut bus, &strings, fiber, 0);
        assert_eq!(result, ShouldRun::ResumeUserCode);
        assert_eq!(bus.sent.len(), 1);
        assert_eq!(bus.sent[0].payload, vec![55]);
    }

    #[test]
    fn resend_backoff_is_non_decreasing_and_capped() {
        let mut reg = RoleRegistry::new();
        let role = reg.allocate("thermo", 1);
        bind(&mut reg, role, 42, 3);
        let mut bridge = FiberBusBridge::new();
        let fiber = bridge.register_fiber(role);
        let strings = FakeStrings(HashMap::new());
        let mut bus = FakeBus::default();

        bridge.get_register(&reg, fiber, role, 0x101, 100, 0, 0);

        let mut now = 0u64;
        let mut timeouts = vec![];
        for _ in 0..10 {
            bridge.should_run(&reg, &mut bus, &strings, fiber, now);
            timeouts.push(bridge.fiber(fiber).resend_timeout_ms);
            now += 2000;
        }
        for w in timeouts.windows(2) {
            assert!(w[1] >= w[0]);
        }
        assert_eq!(*timeouts.last().unwrap(), MAX_RESEND_MS);
    }

    #[test]
    fn send_cmd_on_condition_role_broadcasts_without_transmitting() {
        let mut reg = RoleRegistry::new();
        let role = reg.allocate_hidden("cond", SERVICE_CLASS_JACSCRIPT_CONDITION);
        let mut bridge = FiberBusBridge::new();
        let waiter = bridge.register_fiber(role);
        let signaller = bridge.register_fiber(role);
        let mut sched = FakeScheduler::default();

        let outcome = bridge.send_cmd(&reg, &mut sched, signaller, role, 0, 0);
        assert_eq!(outcome, SendCmdOutcome::ConditionBroadcast);
        assert!(sched.woken.borrow().contains(&waiter));
        assert!(sched.woken.borrow().contains(&signaller));
    }

    #[test]
    fn role_changed_clears_cache_resets_packet_and_wakes_fibers() {
        let mut reg = RoleRegistry::new();
        let role = reg.allocate("thermo", 1);
        bind(&mut reg, role, 42, 3);
        let mut bridge = FiberBusBridge::new();
        let fiber = bridge.register_fiber(role);
        let strings = FakeStrings(HashMap::new());
        let mut bus = FakeBus::default();
        let mut sched = FakeScheduler::default();

        populate_cache(
            &mut bridge, &reg, &strings, &mut bus, fiber, role, 0x101, 42, 3, vec![1, 2], 0,
        );
        assert!(bridge.cache.lookup(role, 0x101, 0).is_some());

        bridge.role_changed(&mut sched, role);

        assert!(bridge.cache.lookup(role, 0x101, 0).is_none());
        assert!(sched.woken.borrow().contains(&fiber));
        assert_eq!(*sched.pokes.borrow(), 1);
    }

    #[test]
    fn change_event_ages_cache_by_ten_seconds() {
        let mut reg = RoleRegistry::new();
        let role = reg.allocate("thermo", 1);
        bind(&mut reg, role, 42, 3);
        let mut bridge = FiberBusBridge::new();
        let fiber = bridge.register_fiber(role);
        let strings = FakeStrings(HashMap::new());
        let mut bus = FakeBus::default();
        let mut sched = FakeScheduler::default();

        populate_cache(
            &mut bridge, &reg, &strings, &mut bus, fiber, role, 0x101, 42, 3, vec![1], 20_000,
        );
        let handle = bridge.cache.lookup(role, 0x101, 0).unwrap();
        assert_eq!(bridge.cache.last_refresh_ms(handle), 20_000);

        bridge.process_pkt(
            &reg,
            &strings,
            &mut sched,
            Packet {
                device_id: 42,
                service_index: 3,
                service_command: RoleManagerEvent::Change as u16,
                kind: PacketKind::Event,
                payload: vec![],
            },
            25_000,
        );
        let handle = bridge.cache.lookup(role, 0x101, 0).unwrap();
        assert_eq!(bridge.cache.last_refresh_ms(handle), 15_000);
    }
}
