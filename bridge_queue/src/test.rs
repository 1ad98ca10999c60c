//! Unit tests for the queue fabric: ring arithmetic, FIFO completion
//! routing, doorbell discipline, reservation backpressure and desync
//! handling, driven through the mock platform playing the device.

use super::*;
use bridge_testkit::MockPlatform;
use std::sync::Mutex as StdMutex;
use std::thread;

fn setup() -> (Arc<MockPlatform>, QueueFabric) {
    let platform = Arc::new(MockPlatform::new());
    let fabric = QueueFabric::new(platform.clone());
    (platform, fabric)
}

/// A callback that drains every routed completion into a shared log.
fn logging_callback(log: Arc<StdMutex<Vec<CompletionData>>>) -> CompletionCallback {
    Box::new(move |sq| {
        while let Some(c) = sq.next_completion() {
            log.lock().unwrap().push(c);
            sq.notify_submission_complete();
        }
    })
}

/// Plays the device: writes a completion entry into the CQ ring at `index`,
/// publishing the pending flag last, the way the hardware contract orders it.
fn post_completion(
    platform: &MockPlatform,
    cq: &CompletionQueue,
    index: usize,
    entry: RawCompletion,
) {
    let base = platform.coherent_host_ptr(cq.ring_dma()).unwrap() as *mut RawCompletion;
    unsafe {
        let p = base.add(index);
        let mut staged = entry;
        staged.flags = 0;
        write_volatile(p, staged);
        fence(Ordering::Release);
        write_volatile(addr_of_mut!((*p).flags), COMPLETION_FLAG_PENDING);
    }
}

fn completion_for(sq: &SubmissionQueue, completion_index: u16, result: u64) -> RawCompletion {
    RawCompletion {
        data_size: 0,
        result,
        qid: sq.qid(),
        completion_index,
        status: 0,
        flags: 0,
    }
}

/// Submits one single-range descriptor pointing at `addr`.
fn submit_one(sq: &SubmissionQueue, addr: u64) {
    sq.reserve_submission(Some(Duration::ZERO)).unwrap();
    let slot = sq.next_submission();
    let mut desc = Submission::default();
    desc.set_single(DmaAddress(addr), 64);
    slot.write(&desc);
    sq.submit_to_device();
}

#[test]
fn qids_are_assigned_lowest_free_first() {
    let (_platform, fabric) = setup();
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 8, Box::new(|_| {})).unwrap();
    let sq2 = fabric.create_sq(&cq, 64, 8, Box::new(|_| {})).unwrap();
    assert_eq!(cq.qid(), 0);
    assert_eq!(sq.qid(), 1);
    assert_eq!(sq2.qid(), 2);

    // A destroyed qid is reused by the next creation.
    fabric.destroy_sq(&sq);
    let sq3 = fabric.create_sq(&cq, 64, 8, Box::new(|_| {})).unwrap();
    assert_eq!(sq3.qid(), 1);
}

/// P1: a ring of N slots holds at most N-1 submissions, and the in-flight
/// count stays within bounds at every observation point.
#[test]
fn ring_never_fills_completely() {
    let (_platform, fabric) = setup();
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 4, Box::new(|_| {})).unwrap();

    for _ in 0..3 {
        sq.reserve_submission(Some(Duration::ZERO)).unwrap();
        assert!(sq.in_flight() < 4);
    }
    // (tail + 1) % N == head with every slot reserved: full.
    assert_eq!(sq.reserve_submission(Some(Duration::ZERO)), Err(Error::NoSpace));

    // Reservations turn into slots 0..3 in order.
    for expected in 0..3 {
        let slot = sq.next_submission();
        assert_eq!(slot.index(), expected);
    }
    assert_eq!(sq.in_flight(), 3);
}

/// P1: reserving on a full ring blocks until a completion frees a slot.
#[test]
fn reservation_blocks_until_completion_frees_a_slot() {
    let (platform, fabric) = setup();
    let log = Arc::new(StdMutex::new(Vec::new()));
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 4, logging_callback(log)).unwrap();

    for addr in [0x1000, 0x2000, 0x3000] {
        submit_one(&sq, addr);
    }

    let sq2 = sq.clone();
    let blocked = thread::spawn(move || sq2.reserve_submission(None));
    thread::sleep(Duration::from_millis(20));
    assert!(!blocked.is_finished());

    post_completion(&platform, &cq, 0, completion_for(&sq, 0, 0));
    fabric.handle_completion_interrupt();

    assert_eq!(blocked.join().unwrap(), Ok(()));
    sq.cancel_submission_reservation();
}

/// P2: two submissions on one queue complete through the callback in
/// submission order.
#[test]
fn completions_route_in_fifo_order() {
    let (platform, fabric) = setup();
    let log = Arc::new(StdMutex::new(Vec::new()));
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 8, logging_callback(log.clone())).unwrap();

    submit_one(&sq, 0x1000);
    submit_one(&sq, 0x2000);

    post_completion(&platform, &cq, 0, completion_for(&sq, 0, 0xA));
    post_completion(&platform, &cq, 1, completion_for(&sq, 1, 0xB));
    fabric.handle_completion_interrupt();

    let seen: Vec<u64> = log.lock().unwrap().iter().map(|c| c.result).collect();
    assert_eq!(seen, [0xA, 0xB]);
    assert_eq!(sq.in_flight(), 0);
    assert_eq!(sq.head_index(), 2);
}

/// P3: when the doorbell carries the value T, every slot in [0, T) is fully
/// initialised as seen from the device side of the ring.
#[test]
fn doorbell_write_follows_slot_publication() {
    let (platform, fabric) = setup();
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 8, Box::new(|_| {})).unwrap();

    // Batch producer: three slots filled, one doorbell.
    for addr in [0x1111u64, 0x2222, 0x3333] {
        sq.reserve_submission(Some(Duration::ZERO)).unwrap();
        let slot = sq.next_submission();
        let mut desc = Submission::default();
        desc.set_single(DmaAddress(addr), 0x40);
        slot.write(&desc);
    }
    sq.submit_to_device();

    let bells = platform.doorbell_writes();
    assert_eq!(bells, [(sq.qid(), 3)]);

    // The device, observing T == 3, reads back all three descriptors intact.
    let ring = platform.coherent_host_ptr(sq.ring_dma()).unwrap() as *const Submission;
    fence(Ordering::Acquire);
    for (i, addr) in [0x1111u64, 0x2222, 0x3333].iter().enumerate() {
        let desc = unsafe { read_volatile(ring.add(i)) };
        assert_eq!(desc.addr, *addr);
        assert_eq!(desc.length, 0x40);
    }
}

/// Scenario: a ring with four usable slots carrying four outstanding
/// submissions; a fifth reservation with a 100 ms timeout blocks, expires
/// with `NoSpace`, and leaves `tail` untouched.
#[test]
fn saturated_reservation_times_out_without_moving_tail() {
    let (platform, fabric) = setup();
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 5, Box::new(|_| {})).unwrap();

    for addr in [0x1000, 0x2000, 0x3000, 0x4000] {
        submit_one(&sq, addr);
    }
    let bells_before = platform.doorbell_writes();

    let started = Instant::now();
    assert_eq!(
        sq.reserve_submission(Some(Duration::from_millis(100))),
        Err(Error::NoSpace)
    );
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(sq.in_flight(), 4);
    assert_eq!(platform.doorbell_writes(), bells_before);
}

/// Scenario: the device reports a completion index the queue does not
/// expect. The queue is marked dead, the callback never runs, the ring does
/// not advance, and the next caller sees `ProtocolDesync`.
#[test]
fn completion_index_mismatch_is_fatal_for_the_queue() {
    let (platform, fabric) = setup();
    let log = Arc::new(StdMutex::new(Vec::new()));
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 8, logging_callback(log.clone())).unwrap();

    submit_one(&sq, 0x1000);
    post_completion(&platform, &cq, 0, completion_for(&sq, 7, 0));
    fabric.handle_completion_interrupt();

    assert!(sq.is_desynced());
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(sq.head_index(), 0);
    assert_eq!(sq.in_flight(), 1);
    assert_eq!(
        sq.reserve_submission(Some(Duration::ZERO)),
        Err(Error::ProtocolDesync)
    );
}

/// A completion addressed to a queue that does not exist is logged and
/// dropped; entries behind it still route.
#[test]
fn unknown_target_qid_is_dropped_not_fatal() {
    let (platform, fabric) = setup();
    let log = Arc::new(StdMutex::new(Vec::new()));
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 8, logging_callback(log.clone())).unwrap();

    submit_one(&sq, 0x1000);

    let bogus = RawCompletion { qid: 0x55, completion_index: 0, ..Default::default() };
    post_completion(&platform, &cq, 0, bogus);
    post_completion(&platform, &cq, 1, completion_for(&sq, 0, 0xCAFE));
    fabric.handle_completion_interrupt();

    let seen: Vec<u64> = log.lock().unwrap().iter().map(|c| c.result).collect();
    assert_eq!(seen, [0xCAFE]);
}

/// Draining a CQ publishes the new consumer index on the CQ doorbell, once
/// per drain pass.
#[test]
fn cq_doorbell_carries_consumer_index() {
    let (platform, fabric) = setup();
    let log = Arc::new(StdMutex::new(Vec::new()));
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 8, logging_callback(log)).unwrap();

    submit_one(&sq, 0x1000);
    submit_one(&sq, 0x2000);
    post_completion(&platform, &cq, 0, completion_for(&sq, 0, 0));
    post_completion(&platform, &cq, 1, completion_for(&sq, 1, 0));
    fabric.handle_completion_interrupt();

    let cq_bells: Vec<u32> = platform
        .doorbell_writes()
        .iter()
        .filter(|(qid, _)| *qid == cq.qid())
        .map(|(_, v)| *v)
        .collect();
    assert_eq!(cq_bells, [2]);

    // Nothing pending: another interrupt writes no CQ doorbell.
    fabric.handle_completion_interrupt();
    assert_eq!(
        platform
            .doorbell_writes()
            .iter()
            .filter(|(qid, _)| *qid == cq.qid())
            .count(),
        1
    );
}

/// The consumer index wraps modulo the element count.
#[test]
fn cq_index_wraps_modulo_el_count() {
    let (platform, fabric) = setup();
    let log = Arc::new(StdMutex::new(Vec::new()));
    let cq = fabric.create_cq(4).unwrap();
    let sq = fabric.create_sq(&cq, 64, 8, logging_callback(log.clone())).unwrap();

    for round in 0..6u64 {
        submit_one(&sq, 0x1000 + round);
        post_completion(
            &platform,
            &cq,
            (round % 4) as usize,
            completion_for(&sq, (round % 8) as u16, round),
        );
        fabric.handle_completion_interrupt();
    }
    let seen: Vec<u64> = log.lock().unwrap().iter().map(|c| c.result).collect();
    assert_eq!(seen, [0, 1, 2, 3, 4, 5]);
}

/// A completion arriving while nothing is in flight is a device protocol
/// error: dropped, queue untouched.
#[test]
fn completion_on_idle_queue_is_dropped() {
    let (platform, fabric) = setup();
    let log = Arc::new(StdMutex::new(Vec::new()));
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 8, logging_callback(log.clone())).unwrap();

    post_completion(&platform, &cq, 0, completion_for(&sq, 0, 0xDEAD));
    fabric.handle_completion_interrupt();

    assert!(log.lock().unwrap().is_empty());
    assert!(!sq.is_desynced());
    assert_eq!(sq.head_index(), 0);
}

/// A cancelled reservation restores the queue's capacity.
#[test]
fn cancelled_reservation_frees_the_slot() {
    let (_platform, fabric) = setup();
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 4, Box::new(|_| {})).unwrap();

    for _ in 0..3 {
        sq.reserve_submission(Some(Duration::ZERO)).unwrap();
    }
    assert_eq!(sq.reserve_submission(Some(Duration::ZERO)), Err(Error::NoSpace));
    sq.cancel_submission_reservation();
    sq.reserve_submission(Some(Duration::ZERO)).unwrap();
}

/// Teardown aborts parked reservers, then destroy completes once the ring
/// drains, and the coherent backing is returned to the platform.
#[test]
fn shutdown_aborts_parked_reservers_and_destroy_frees_backing() {
    let (platform, fabric) = setup();
    let log = Arc::new(StdMutex::new(Vec::new()));
    let cq = fabric.create_cq(8).unwrap();
    let sq = fabric.create_sq(&cq, 64, 4, logging_callback(log)).unwrap();

    for addr in [0x1000, 0x2000, 0x3000] {
        submit_one(&sq, addr);
    }
    let sq2 = sq.clone();
    let parked = thread::spawn(move || sq2.reserve_submission(None));
    thread::sleep(Duration::from_millis(20));

    sq.shutdown();
    assert_eq!(parked.join().unwrap(), Err(Error::Aborted));
    assert_eq!(sq.reserve_submission(Some(Duration::ZERO)), Err(Error::Busy));

    for i in 0..3u16 {
        post_completion(&platform, &cq, i as usize, completion_for(&sq, i, 0));
    }
    fabric.handle_completion_interrupt();

    let live_before = platform.live_coherent_allocations();
    fabric.destroy_sq(&sq);
    drop(sq);
    assert_eq!(platform.live_coherent_allocations(), live_before - 1);
}
