//! Harness for the role-manager subsystem: wires [`rolebus_core::RoleManager`]
//! to an in-memory bus simulator so the subsystem can run, and be
//! integration-tested, on the host.

pub mod sim;
