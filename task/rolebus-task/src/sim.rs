//! An in-memory bus simulator standing in for the physical transport,
//! framing, and script scheduler that `rolebus-core` explicitly keeps out
//! of scope. None of this is part of the subsystem itself;
//! it exists only so this harness (and its integration tests) can drive
//! `RoleManager` the way a real device-bus host and script runtime would.

use rolebus_core::bridge::{FiberId, Packet};
use rolebus_core::collab::{BusSink, Clock, DeviceBus, Pipe, PipeStatus, Scheduler, ServiceKey, ServiceView, StringTable};
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

/// A fake device/service table: `(device_id, service_index) -> (class, assigned)`.
#[derive(Default)]
pub struct SimBus {
    services: HashMap<ServiceKey, (u32, bool)>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service endpoint as it would appear after device
    /// enumeration. `service_index` 0 is reserved for a device's control
    /// service and is never offered to autobind.
    pub fn add_service(&mut self, device_id: u64, service_index: u8, service_class: u32) {
        self.services.insert(ServiceKey { device_id, service_index }, (service_class, false));
    }

    pub fn remove_device(&mut self, device_id: u64) {
        self.services.retain(|k, _| k.device_id != device_id);
    }
}

impl DeviceBus for SimBus {
    fn scan_services(&self) -> Vec<ServiceView> {
        self.services
            .iter()
            .filter(|(key, _)| key.service_index != 0)
            .map(|(key, (class, assigned))| ServiceView {
                key: *key,
                service_class: *class,
                flags: role_flags(*assigned),
            })
            .collect()
    }

    fn find_service(&self, key: ServiceKey) -> Option<ServiceView> {
        self.services.get(&key).map(|(class, assigned)| ServiceView {
            key,
            service_class: *class,
            flags: role_flags(*assigned),
        })
    }

    fn set_role_assigned(&mut self, key: ServiceKey, assigned: bool) {
        if let Some(entry) = self.services.get_mut(&key) {
            entry.1 = assigned;
        }
    }
}

fn role_flags(assigned: bool) -> rolebus_abi::ServiceFlags {
    let mut flags = rolebus_abi::ServiceFlags::empty();
    flags.set(rolebus_abi::ServiceFlags::ROLE_ASSIGNED, assigned);
    flags
}

/// Records every packet the Bridge hands across the transport seam.
#[derive(Default)]
pub struct SimTransport {
    pub sent: Vec<Packet>,
}

impl BusSink for SimTransport {
    fn send(&mut self, packet: &Packet) {
        self.sent.push(packet.clone());
    }
}

/// Records which fibers were woken and how many times the run loop was
/// poked, standing in for the script scheduler.
#[derive(Default)]
pub struct SimScheduler {
    pub woken: Vec<FiberId>,
    pub pokes: u32,
}

impl Scheduler for SimScheduler {
    fn run_fiber(&mut self, fiber: FiberId) {
        self.woken.push(fiber);
    }
    fn poke(&mut self) {
        self.pokes += 1;
    }
}

/// A fixed interned-string table, standing in for the script runtime's.
#[derive(Default)]
pub struct SimStrings(pub HashMap<u32, Vec<u8>>);

impl StringTable for SimStrings {
    fn get(&self, index: u32) -> &[u8] {
        self.0.get(&index).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// A monotonic clock under direct test control.
#[derive(Clone, Default)]
pub struct SimClock(Rc<Cell<u64>>);

impl SimClock {
    pub fn new(now_ms: u64) -> Self {
        Self(Rc::new(Cell::new(now_ms)))
    }

    pub fn advance(&self, delta_ms: u64) {
        self.0.set(self.0.get() + delta_ms);
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

struct PipeInner {
    capacity: usize,
    written: Vec<u8>,
    closed: bool,
}

/// A back-pressured pipe with a fixed byte budget, standing in for the
/// enumeration output stream. Cloneable so a test can hand one
/// clone's ownership to the dispatcher while keeping another to inspect.
#[derive(Clone)]
pub struct SimPipe(Rc<std::cell::RefCell<PipeInner>>);

impl SimPipe {
    pub fn new(capacity: usize) -> Self {
        Self(Rc::new(std::cell::RefCell::new(PipeInner {
            capacity,
            written: Vec::new(),
            closed: false,
        })))
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }

    pub fn written(&self) -> Vec<u8> {
        self.0.borrow().written.clone()
    }

    /// Frees up `n` more bytes of budget, simulating the consumer side
    /// draining the pipe between scheduler ticks.
    pub fn grow_capacity(&self, n: usize) {
        self.0.borrow_mut().capacity += n;
    }
}

impl Pipe for SimPipe {
    fn check_space(&mut self, n: usize) -> PipeStatus {
        let inner = self.0.borrow();
        if inner.closed {
            PipeStatus::Error
        } else if n > inner.capacity {
            PipeStatus::TryAgain
        } else {
            PipeStatus::Ok
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut inner = self.0.borrow_mut();
        inner.capacity -= bytes.len();
        inner.written.extend_from_slice(bytes);
    }

    fn close(&mut self) {
        self.0.borrow_mut().closed = true;
    }
}
