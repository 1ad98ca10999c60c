//! End-to-end bring-up tests: the mock platform plays the device firmware
//! over the mailbox, and the full stack is exercised from probe through a
//! client event queue.

use super::*;
use bridge_platform::DmaAddress;
use bridge_queue::{RawCompletion, Submission, COMPLETION_FLAG_PENDING};
use bridge_testkit::MockPlatform;
use core::ptr::{addr_of_mut, read_volatile, write_volatile};
use core::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::thread;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn setup() -> (Arc<MockPlatform>, Arc<BridgeDevice>) {
    let platform = Arc::new(MockPlatform::new());
    let device = Arc::new(BridgeDevice::new(platform.clone() as Arc<dyn Platform>));
    (platform, device)
}

/// Installs well-behaved device firmware: the handshake echoes, and queue
/// registrations are parsed (recording each memcfg) and acknowledged with
/// the dedicated reply type.
fn install_firmware(
    platform: &Arc<MockPlatform>,
    device: &Arc<BridgeDevice>,
) -> Arc<StdMutex<Vec<(u8, QueueMemcfg)>>> {
    let registrations = Arc::new(StdMutex::new(Vec::new()));
    let seen = registrations.clone();
    let mailbox = device.mailbox().clone();
    let pf = platform.clone();
    platform.set_mailbox_responder(move |msg| {
        let reply = match message_type(msg) {
            MSG_SET_FW_PROTOCOL_VERSION => {
                encode_message(MSG_SET_FW_PROTOCOL_VERSION, message_value(msg))
            }
            t @ MSG_REGISTER_COMMAND_CQ | t @ MSG_REGISTER_COMMAND_SQ => {
                let descriptor = pf
                    .mapped_host_ptr(DmaAddress(message_value(msg)))
                    .expect("registration message must carry a mapped descriptor")
                    as *const QueueMemcfg;
                seen.lock().unwrap().push((t, unsafe { read_volatile(descriptor) }));
                encode_message(MSG_REGISTER_COMMAND_QUEUE_REPLY, 0)
            }
            t => panic!("unexpected mailbox message type {:#x}", t),
        };
        pf.push_mailbox_reply(reply);
        mailbox.handle_interrupt();
    });
    registrations
}

/// Scenario: a clean bring-up. The handshake echoes `0x20001`, CQ 0 and
/// SQ 1 come up, and two registration messages cross the mailbox carrying
/// the DMA addresses of the coherent rings and element count `0x20`.
#[test]
fn probe_registers_the_bootstrap_pair() {
    let (platform, device) = setup();
    let registrations = install_firmware(&platform, &device);

    device.probe(TIMEOUT).unwrap();

    let sent = platform.sent_mailbox_messages();
    assert_eq!(sent.len(), 3);
    assert_eq!(message_type(sent[0]), MSG_SET_FW_PROTOCOL_VERSION);
    assert_eq!(message_value(sent[0]), 0x20001);

    let cmd_cq = device.command_cq().unwrap();
    let cmdq = device.dispatcher().unwrap();
    assert_eq!(cmd_cq.qid(), 0);
    assert_eq!(cmdq.sq().qid(), 1);

    let registrations = registrations.lock().unwrap();
    assert_eq!(registrations.len(), 2);

    let (cq_type, cq_cfg) = registrations[0];
    assert_eq!(cq_type, MSG_REGISTER_COMMAND_CQ);
    assert_eq!(cq_cfg.qid, 0);
    assert_eq!(cq_cfg.el_count, 0x20);
    assert_eq!(cq_cfg.addr, cmd_cq.ring_dma().value());

    let (sq_type, sq_cfg) = registrations[1];
    assert_eq!(sq_type, MSG_REGISTER_COMMAND_SQ);
    assert_eq!(sq_cfg.qid, 1);
    assert_eq!(sq_cfg.el_count, 0x20);
    assert_eq!(sq_cfg.vector_or_cq, 0);
    assert_eq!(sq_cfg.addr, cmdq.sq().ring_dma().value());
    assert_eq!(sq_cfg.length, 0x20 * 64);

    // The memcfg descriptors were transient: mapped, sent, unmapped.
    assert_eq!(platform.active_mappings(), 0);
}

/// Scenario: the handshake reply carries the wrong type. Probe fails with
/// `ProtocolDesync` and no queue is created.
#[test]
fn handshake_type_mismatch_fails_probe() {
    let (platform, device) = setup();
    let mailbox = device.mailbox().clone();
    let pf = platform.clone();
    platform.set_mailbox_responder(move |msg| {
        pf.push_mailbox_reply(encode_message(0xD, message_value(msg)));
        mailbox.handle_interrupt();
    });

    assert_eq!(device.probe(TIMEOUT), Err(Error::ProtocolDesync));
    assert!(device.dispatcher().is_none());
    assert_eq!(platform.sent_mailbox_messages().len(), 1);
    assert_eq!(platform.live_coherent_allocations(), 0);
}

/// The handshake value must echo exactly; a version skew is a desync.
#[test]
fn handshake_value_mismatch_fails_probe() {
    let (platform, device) = setup();
    let mailbox = device.mailbox().clone();
    let pf = platform.clone();
    platform.set_mailbox_responder(move |_| {
        pf.push_mailbox_reply(encode_message(MSG_SET_FW_PROTOCOL_VERSION, 0x20002));
        mailbox.handle_interrupt();
    });

    assert_eq!(device.probe(TIMEOUT), Err(Error::ProtocolDesync));
    assert_eq!(platform.live_coherent_allocations(), 0);
}

/// A registration acknowledged with the firmware-version type instead of
/// the dedicated reply type is rejected, and the bootstrap queues are torn
/// down again.
#[test]
fn registration_requires_the_dedicated_reply_type() {
    let (platform, device) = setup();
    let mailbox = device.mailbox().clone();
    let pf = platform.clone();
    platform.set_mailbox_responder(move |msg| {
        // Echo the request type back for everything, including the
        // registrations that must be answered with the dedicated type.
        pf.push_mailbox_reply(encode_message(message_type(msg), message_value(msg)));
        mailbox.handle_interrupt();
    });

    assert_eq!(device.probe(TIMEOUT), Err(Error::ProtocolDesync));
    assert!(device.dispatcher().is_none());
    assert_eq!(platform.live_coherent_allocations(), 0);
    assert_eq!(platform.active_mappings(), 0);
}

/// Probing twice is refused.
#[test]
fn second_probe_is_busy() {
    let (platform, device) = setup();
    install_firmware(&platform, &device);
    device.probe(TIMEOUT).unwrap();
    assert_eq!(device.probe(TIMEOUT), Err(Error::Busy));
}

/// Full-stack round trip: probe, bring up a client event queue through the
/// command dispatcher, and deliver one device event through the completion
/// interrupt into the client callback.
#[test]
fn client_event_queue_round_trip() {
    use bridge_msgq::EventQueue;
    use zerocopy::{AsBytes, FromBytes};

    #[derive(AsBytes, FromBytes, Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(C)]
    struct Event {
        cmd: u16,
        status: u16,
        param1: u32,
        param2: u64,
    }

    let (platform, device) = setup();
    install_firmware(&platform, &device);
    device.probe(TIMEOUT).unwrap();

    let cmdq = device.dispatcher().unwrap();
    let fabric = device.fabric().clone();

    // Background device servicing the command dispatcher.
    let stop = Arc::new(AtomicBool::new(false));
    let service = {
        let platform = platform.clone();
        let device = device.clone();
        let cmd_sq = cmdq.sq().clone();
        let cmd_cq = device.command_cq().unwrap();
        let stop = stop.clone();
        thread::spawn(move || {
            let el_count = cmd_sq.el_count() as u32;
            let mut log_pos = 0;
            let mut last_tail = 0u32;
            let mut completed = 0usize;
            while !stop.load(Ordering::Acquire) {
                let log = platform.doorbell_writes();
                let mut submitted = completed;
                for (qid, tail) in &log[log_pos..] {
                    if *qid == cmd_sq.qid() && *tail != last_tail {
                        submitted += ((el_count + tail - last_tail) % el_count) as usize;
                        last_tail = *tail;
                    }
                }
                log_pos = log.len();
                while completed < submitted {
                    let entry = RawCompletion {
                        qid: cmd_sq.qid(),
                        completion_index: (completed % el_count as usize) as u16,
                        ..Default::default()
                    };
                    let base = platform.coherent_host_ptr(cmd_cq.ring_dma()).unwrap()
                        as *mut RawCompletion;
                    unsafe {
                        let p = base.add(completed % cmd_cq.el_count());
                        let mut staged = entry;
                        staged.flags = 0;
                        write_volatile(p, staged);
                        fence(Ordering::Release);
                        write_volatile(addr_of_mut!((*p).flags), COMPLETION_FLAG_PENDING);
                    }
                    completed += 1;
                    device.handle_completion_interrupt();
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let ev_cq = fabric.create_cq(0x20).unwrap();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = seen.clone();
    let ev = EventQueue::<Event>::create(
        &fabric,
        &cmdq,
        &ev_cq,
        "DevSystemEvents",
        16,
        4,
        move |event: &Event| sink.lock().unwrap().push(*event),
        TIMEOUT,
    )
    .unwrap();
    assert_eq!(ev.sq().in_flight(), 4);

    // The device fills the record behind the first pre-posted submission
    // and completes it.
    let ring = platform.coherent_host_ptr(ev.sq().ring_dma()).unwrap() as *const Submission;
    fence(Ordering::Acquire);
    let sub = unsafe { read_volatile(ring) };
    let record_ptr = platform.coherent_host_ptr(DmaAddress(sub.addr)).unwrap() as *mut Event;
    let event = Event { cmd: 0x8001, status: 0, param1: 1, param2: 0x5555 };
    unsafe { write_volatile(record_ptr, event) };

    let cq_base = platform.coherent_host_ptr(ev_cq.ring_dma()).unwrap() as *mut RawCompletion;
    unsafe {
        let entry = RawCompletion {
            qid: ev.sq().qid(),
            completion_index: 0,
            data_size: core::mem::size_of::<Event>() as u64,
            ..Default::default()
        };
        write_volatile(cq_base, entry);
        fence(Ordering::Release);
        write_volatile(addr_of_mut!((*cq_base).flags), COMPLETION_FLAG_PENDING);
    }
    device.handle_completion_interrupt();

    assert_eq!(seen.lock().unwrap().as_slice(), &[event]);
    assert_eq!(ev.sq().in_flight(), 4);

    ev.destroy(&fabric, &cmdq, TIMEOUT).unwrap();
    stop.store(true, Ordering::Release);
    service.join().unwrap();
}
