//! Termination Tests
//!
//! Request, exit on the thread's own core, worker finalization and the
//! final close.

use crate::config::KernelConfig;
use crate::scheduler::thread::ThreadParams;
use crate::scheduler::{AffinityMask, KernelError, SuspendType, ThreadState, TERMINATING_THREAD_PRIORITY};
use crate::smp::InterruptId;

use super::{assert_consistent, boot, boot_with};

#[test]
fn test_terminate_thread_running_on_other_core() {
    let (kernel, irq) = boot(2);
    let victim = kernel.spawn(1, ThreadParams::kernel("victim", 30, 1)).unwrap();
    assert_eq!(kernel.current_thread(1), victim);

    assert_eq!(kernel.request_terminate(0, victim), Ok(ThreadState::Runnable));
    assert!(irq.is_pending(1, InterruptId::ThreadTerminate));
    let info = kernel.thread_info(victim).unwrap();
    assert!(info.termination_requested);
    assert_eq!(info.priority, TERMINATING_THREAD_PRIORITY);

    kernel.service_interrupts(1);
    assert_eq!(kernel.current_thread(1), kernel.idle_thread(1));
    let info = kernel.thread_info(victim).unwrap();
    assert_eq!(info.state, ThreadState::Terminated);
    assert!(info.finalized);
    assert_eq!(kernel.pending_worker_tasks(), 0);

    kernel.close_thread(0, victim).unwrap();
    assert!(kernel.thread_info(victim).is_none());
    assert_consistent(&kernel);
}

#[test]
fn test_terminate_is_idempotent() {
    let (kernel, irq) = boot(2);
    let victim = kernel.spawn(1, ThreadParams::kernel("victim", 30, 1)).unwrap();
    kernel.request_terminate(0, victim).unwrap();
    let sent = irq.sent_count();

    assert_eq!(kernel.request_terminate(0, victim), Ok(ThreadState::Runnable));
    assert_eq!(irq.sent_count(), sent);
}

#[test]
fn test_terminate_never_started_thread() {
    let (kernel, _irq) = boot(1);
    let id = kernel.create_thread(0, ThreadParams::kernel("unborn", 30, 0)).unwrap();

    assert_eq!(kernel.request_terminate(0, id), Ok(ThreadState::Terminated));
    let info = kernel.thread_info(id).unwrap();
    assert!(info.finalized);
    assert_eq!(kernel.run(0, id), Err(KernelError::InvalidState));

    kernel.close_thread(0, id).unwrap();
    assert!(kernel.thread_info(id).is_none());
}

#[test]
fn test_terminate_waiting_thread() {
    let (kernel, _irq) = boot(1);
    let q = kernel.create_wait_queue(0, "event").unwrap();
    let t = kernel.spawn(0, ThreadParams::kernel("t", 30, 0)).unwrap();
    kernel.wait_on_queue(0, q, None).unwrap();
    assert_eq!(kernel.current_thread(0), kernel.idle_thread(0));

    assert_eq!(kernel.request_terminate(0, t), Ok(ThreadState::Runnable));
    assert_eq!(kernel.wait_result(t), Some(Err(KernelError::TerminationRequested)));
    assert_eq!(kernel.wake_one(0, q), Ok(None));

    // It runs once more, notices on its own core and exits.
    assert_eq!(kernel.current_thread(0), t);
    kernel.handle_dpc(0);
    assert_eq!(kernel.current_thread(0), kernel.idle_thread(0));
    assert!(kernel.thread_info(t).unwrap().finalized);
}

#[test]
fn test_terminating_thread_cannot_wait() {
    let (kernel, _irq) = boot(1);
    let q = kernel.create_wait_queue(0, "event").unwrap();
    let t = kernel.spawn(0, ThreadParams::kernel("t", 30, 0)).unwrap();
    kernel.request_terminate(0, t).unwrap();

    assert_eq!(kernel.wait_on_queue(0, q, None), Err(KernelError::TerminationRequested));
    assert_eq!(kernel.sleep(0, 4), Err(KernelError::TerminationRequested));
}

#[test]
fn test_exit_current_thread_finalized_by_worker() {
    let (kernel, _irq) = boot(1);
    let t = kernel.spawn(0, ThreadParams::kernel("t", 30, 0)).unwrap();

    assert_eq!(kernel.exit_current_thread(0), Ok(t));
    assert_eq!(kernel.current_thread(0), kernel.idle_thread(0));
    assert_eq!(kernel.pending_worker_tasks(), 1);
    assert!(!kernel.thread_info(t).unwrap().finalized);

    assert_eq!(kernel.run_worker_tasks(0), 1);
    assert_eq!(kernel.pending_worker_tasks(), 0);
    assert!(kernel.thread_info(t).unwrap().finalized);
    assert_consistent(&kernel);
}

#[test]
fn test_worker_batch_limits_pass() {
    let mut config = KernelConfig::with_cores(1);
    config.worker_batch = 1;
    let (kernel, _irq) = boot_with(config);

    kernel.spawn(0, ThreadParams::kernel("a", 30, 0)).unwrap();
    kernel.exit_current_thread(0).unwrap();
    kernel.spawn(0, ThreadParams::kernel("b", 30, 0)).unwrap();
    kernel.exit_current_thread(0).unwrap();
    assert_eq!(kernel.pending_worker_tasks(), 2);

    assert_eq!(kernel.run_worker_tasks(0), 1);
    assert_eq!(kernel.run_worker_tasks(0), 1);
    assert_eq!(kernel.run_worker_tasks(0), 0);
}

#[test]
fn test_terminate_lifts_suspension() {
    let (kernel, _irq) = boot(1);
    let pid = kernel.create_process(0, "app", 0, AffinityMask::all(1)).unwrap();
    let t = kernel.spawn(0, ThreadParams::user("t", pid, 40, 0, AffinityMask::all(1))).unwrap();
    kernel.suspend_thread(0, t, SuspendType::Thread).unwrap();
    assert_eq!(kernel.current_thread(0), kernel.idle_thread(0));

    kernel.request_terminate(0, t).unwrap();
    assert!(kernel.thread_info(t).unwrap().effective.is_ready());
    assert_eq!(kernel.current_thread(0), t);
    assert_eq!(kernel.suspend_thread(0, t, SuspendType::Debug), Err(KernelError::TerminationRequested));
}

#[test]
fn test_system_priority_is_kept_on_terminate() {
    let (kernel, _irq) = boot(2);
    let t = kernel.spawn(1, ThreadParams::kernel("sys", 4, 1)).unwrap();
    kernel.request_terminate(0, t).unwrap();
    assert_eq!(kernel.thread_info(t).unwrap().priority, 4);
}

#[test]
fn test_exit_of_process_thread_unregisters_it() {
    let (kernel, _irq) = boot(1);
    let pid = kernel.create_process(0, "app", 0, AffinityMask::all(1)).unwrap();
    let t = kernel.spawn(0, ThreadParams::user("t", pid, 30, 0, AffinityMask::all(1))).unwrap();
    kernel.pin_current_thread(0).unwrap();
    assert_eq!(kernel.process_info(pid).unwrap().threads, vec![t]);

    kernel.exit_current_thread(0).unwrap();
    kernel.run_worker_tasks(0);
    let process = kernel.process_info(pid).unwrap();
    assert!(process.threads.is_empty());
    assert_eq!(process.pinned, vec![None]);
}
