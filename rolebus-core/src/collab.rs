//! Traits for the external collaborators this subsystem relies on but
//! never implements itself: the device/service bus, the enumeration pipe,
//! the monotonic clock, and the script runtime's string table. `rolebus-core`
//! never implements any of these; `task/rolebus-task` provides a
//! simulated bus for its harness, and `#[cfg(test)]` modules provide
//! small fakes, in the style of `lib/multitimer`'s host-mode fakes.

use rolebus_abi::ServiceFlags;

/// A monotonic millisecond clock. The real implementation is whatever
/// the hosting scheduler uses for `now()`; tests use a `Cell<u64>`.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Result of asking a pipe to reserve space for the next write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipeStatus {
    Ok,
    TryAgain,
    Error,
}

/// A back-pressured output byte stream, already opened from a command
/// packet by the caller (opening is the Dispatcher's job; this trait
/// covers only the write side).
pub trait Pipe {
    fn check_space(&mut self, n: usize) -> PipeStatus;
    fn write(&mut self, bytes: &[u8]);
    fn close(&mut self);
}

/// Identifies a service endpoint on the bus without holding a reference
/// to it -- the core's "weak reference" to a device-service endpoint is
/// just this key, which may stop resolving at any time if the device
/// subsystem destroys the endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub device_id: u64,
    pub service_index: u8,
}

/// One service endpoint as seen during an autobind scan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ServiceView {
    pub key: ServiceKey,
    pub service_class: u32,
    pub flags: ServiceFlags,
}

/// The device/service bus. The core only ever reads `service_class` and
/// the `ROLE_ASSIGNED` bit of `flags`, and only ever writes that one bit.
pub trait DeviceBus {
    /// All service endpoints eligible for autobind scanning, in
    /// device-then-index order, with each device's own index-0 control
    /// service already excluded (mirroring the source's `for (i = 1; ...)`
    /// loop bound).
    fn scan_services(&self) -> Vec<ServiceView>;

    /// Resolve a specific endpoint, e.g. to validate a `SET_ROLE` command.
    fn find_service(&self, key: ServiceKey) -> Option<ServiceView>;

    /// Set or clear `ROLE_ASSIGNED` on an endpoint. A no-op if the
    /// endpoint no longer exists (the device may have been destroyed).
    fn set_role_assigned(&mut self, key: ServiceKey, assigned: bool);
}

/// The script runtime's interned-string table, used to resolve a
/// register's indexing argument (`command_arg`) to bytes for comparison
/// against an indexed-register reply, or to send as an outgoing payload.
pub trait StringTable {
    fn get(&self, index: u32) -> &[u8];
}

/// Sink for packets the Bridge transmits. Physical transport and framing
/// are out of scope; this is the seam the core hands finished logical
/// packets across.
pub trait BusSink {
    fn send(&mut self, packet: &crate::bridge::Packet);
}

/// Running a woken fiber and poking the scheduler loop are both the
/// script runtime's job, out of scope here; the Bridge only ever calls
/// through this seam, never executes a fiber itself.
pub trait Scheduler {
    fn run_fiber(&mut self, fiber: crate::bridge::FiberId);
    fn poke(&mut self);
}
