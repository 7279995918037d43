//! Standalone demonstration of the role-manager subsystem driven against
//! an in-memory bus. Not a real Hubris task -- there is no physical bus,
//! IPC server, or script interpreter here, all three being deliberately
//! out of scope for this subsystem; this binary exists to exercise
//! [`rolebus_core::RoleManager`] end to end the way `task/rolebus-task`'s
//! integration tests do.

use rolebus_abi::{RoleManagerCmd, SetRoleHeader};
use rolebus_core::bridge::{GetRegisterOutcome, PacketKind, Packet};
use rolebus_core::RoleManager;
use task_rolebus::sim::{SimBus, SimPipe, SimScheduler, SimStrings, SimTransport};

fn main() {
    let mut mgr = RoleManager::new(0);
    let mut bus = SimBus::new();
    let mut sched = SimScheduler::default();
    let mut transport = SimTransport::default();
    let strings = SimStrings::default();

    bus.add_service(0x1001, 1, 42); // a thermometer-class service
    bus.add_service(0x1002, 1, 42); // a second one, for later

    let thermo = mgr.allocate_role("thermo", 42);
    println!("allocated role `thermo` ({thermo:?})");

    mgr.tick(rolebus_core::manager::AUTOBIND_PERIOD_MS, &mut bus, &mut sched);
    println!("after autobind: thermo bound to {:?}", mgr.registry().role(thermo).unwrap().binding);

    let fiber = mgr.register_fiber(thermo);
    match mgr.get_register(fiber, thermo, 0x101, 100, 0, rolebus_core::manager::AUTOBIND_PERIOD_MS) {
        GetRegisterOutcome::Parked => println!("fiber parked waiting on a live read"),
        GetRegisterOutcome::CacheHit => println!("unexpected cache hit on first read"),
    }
    mgr.should_run(&mut transport, &strings, fiber, rolebus_core::manager::AUTOBIND_PERIOD_MS);
    println!("transmitted {} request(s) over the simulated bus", transport.sent.len());

    let binding = mgr.registry().role(thermo).unwrap().binding.unwrap();
    mgr.process_pkt(
        &strings,
        &mut sched,
        Packet {
            device_id: binding.device_id,
            service_index: binding.service_index,
            service_command: 0x101,
            kind: PacketKind::Report,
            payload: vec![21, 0],
        },
        rolebus_core::manager::AUTOBIND_PERIOD_MS + 10,
    );
    mgr.should_run(&mut transport, &strings, fiber, rolebus_core::manager::AUTOBIND_PERIOD_MS + 10);
    println!("cached reply: {:?}", mgr.packet().payload);

    let header = SetRoleHeader { device_id: 0, service_idx: 0, pad: [0; 3], service_class: 0 };
    let mut payload = zerocopy::IntoBytes::as_bytes(&header).to_vec();
    payload.extend_from_slice(b"thermo");
    mgr.handle_command(&mut bus, &mut sched, None, RoleManagerCmd::SetRole as u16, &payload).unwrap();
    println!("after SET_ROLE unbind: {:?}", mgr.registry().role(thermo).unwrap().binding);

    let pipe = SimPipe::new(1024);
    mgr.handle_command(&mut bus, &mut sched, Some(Box::new(pipe.clone())), RoleManagerCmd::ListRoles as u16, &[]).unwrap();
    mgr.tick(rolebus_core::manager::AUTOBIND_PERIOD_MS * 2, &mut bus, &mut sched);
    println!("LIST_ROLES wrote {} bytes, closed={}", pipe.written().len(), pipe.is_closed());
}
