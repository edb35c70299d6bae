//! Real-time posture against a fake `/proc` and an in-memory scheduler.

use super::common::{fake_proc, RecordingSched};
use rtt_common::{CpuAffinity, RealtimeConfig, SchedPolicy};
use rtt_runtime::{elevate_irq_thread, init_realtime, RtPosture, SchedChange, SchedOps, ThreadTable};

fn fifo(priority: u8) -> RtPosture {
    RtPosture {
        policy: SchedPolicy::Fifo,
        priority,
        lock_memory: false,
    }
}

#[test]
fn test_irq_lookup_matches_exact_number() {
    let proc_root = fake_proc();
    let table = ThreadTable::new(proc_root.path());

    let mut tids: Vec<i32> = table.irq_threads(45).unwrap().iter().map(|t| t.tid).collect();
    tids.sort_unstable();
    assert_eq!(tids, vec![88, 121]);
    assert_eq!(table.irq_threads(145).unwrap().len(), 1);
    assert!(table.irq_threads(4).unwrap().is_empty());
}

#[test]
fn test_irq_elevation_is_idempotent() {
    let proc_root = fake_proc();
    let table = ThreadTable::new(proc_root.path());
    let sched = RecordingSched::default();

    let first = elevate_irq_thread(&table, &sched, 45, &fifo(90)).unwrap();
    assert_eq!(first.applied.len(), 2);
    assert!(first.unchanged.is_empty());
    assert_eq!(sched.sets.borrow().len(), 2);

    let second = elevate_irq_thread(&table, &sched, 45, &fifo(90)).unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.unchanged.len(), 2);
    assert_eq!(sched.sets.borrow().len(), 2, "no further scheduling calls");

    assert_eq!(sched.get(88).unwrap(), (SchedPolicy::Fifo, 90));
    assert_eq!(sched.get(90).unwrap(), (SchedPolicy::Other, 0));
}

#[test]
fn test_missing_irq_thread_is_not_an_error() {
    let proc_root = fake_proc();
    let table = ThreadTable::new(proc_root.path());
    let sched = RecordingSched::default();

    let outcome = elevate_irq_thread(&table, &sched, 77, &fifo(50)).unwrap();
    assert_eq!(outcome.irq, 77);
    assert!(outcome.applied.is_empty() && outcome.unchanged.is_empty());
    assert!(sched.sets.borrow().is_empty());
}

#[test]
fn test_init_realtime_twice() {
    let proc_root = fake_proc();
    let table = ThreadTable::new(proc_root.path());
    let sched = RecordingSched::default();
    let config = RealtimeConfig {
        enabled: true,
        policy: SchedPolicy::Fifo,
        priority: 80,
        lock_memory: false,
        irq_threads: vec![45],
        cpu_affinity: CpuAffinity::None,
        prefault_stack_size: 16 * 1024,
        fail_fast: false,
    };

    let first = init_realtime(&config, &sched, &table).unwrap();
    assert!(first.degradations.is_empty(), "{:?}", first.degradations);
    assert_eq!(first.posture.as_ref().map(|p| p.scheduling), Some(SchedChange::Applied));
    assert_eq!(first.irq_threads[0].applied.len(), 2);
    assert!(first.stack_prefaulted >= 16 * 1024);
    // Calling thread plus two IRQ threads
    assert_eq!(sched.sets.borrow().len(), 3);

    let second = init_realtime(&config, &sched, &table).unwrap();
    assert_eq!(second.posture.as_ref().map(|p| p.scheduling), Some(SchedChange::Unchanged));
    assert_eq!(second.irq_threads[0].unchanged.len(), 2);
    assert_eq!(sched.sets.borrow().len(), 3);
}

#[test]
fn test_unreadable_proc_root_is_absorbed() {
    let sched = RecordingSched::default();
    let table = ThreadTable::new("/nonexistent/proc");
    let config = RealtimeConfig {
        lock_memory: false,
        irq_threads: vec![45],
        prefault_stack_size: 0,
        ..RealtimeConfig::default()
    };

    let report = init_realtime(&config, &sched, &table).unwrap();
    assert_eq!(report.degradations.len(), 1);
    assert!(report.irq_threads.is_empty());

    let strict = RealtimeConfig {
        fail_fast: true,
        ..config
    };
    // fail_fast turns the same failure (or a missing privilege) into an error
    assert!(init_realtime(&strict, &sched, &table).is_err());
}

#[test]
fn test_disabled_posture_touches_nothing() {
    let proc_root = fake_proc();
    let table = ThreadTable::new(proc_root.path());
    let sched = RecordingSched::default();
    let config = RealtimeConfig {
        enabled: false,
        irq_threads: vec![45],
        ..RealtimeConfig::default()
    };
    let report = init_realtime(&config, &sched, &table).unwrap();
    assert!(report.posture.is_none());
    assert!(sched.sets.borrow().is_empty());
}
