//! Ready Queue Tests
//!
//! Exercises `PriorityQueue` directly, without a scheduler around it.

use crate::scheduler::{AffinityMask, Placement, PriorityQueue, ThreadId};

fn placed(priority: i32, core: Option<usize>, affinity: AffinityMask) -> Placement {
    Placement {
        priority,
        active_core: core,
        affinity,
    }
}

fn t(n: u32) -> ThreadId {
    ThreadId(n)
}

// ============================================================================
// Scheduled lists
// ============================================================================

#[test]
fn test_queue_empty_core_falls_back_to_idle() {
    let mut q = PriorityQueue::new(2);
    assert_eq!(q.highest_priority_thread(0), None);
    q.set_idle_thread(0, t(0));
    assert_eq!(q.highest_priority_thread(0), Some(t(0)));
    assert_eq!(q.scheduled_front(0), None);
}

#[test]
fn test_queue_best_level_first_fifo_within_level() {
    let mut q = PriorityQueue::new(1);
    let one = AffinityMask::single(0);
    q.push_back(t(1), placed(30, Some(0), one));
    q.push_back(t(2), placed(10, Some(0), one));
    q.push_back(t(3), placed(30, Some(0), one));
    q.push_back(t(4), placed(10, Some(0), one));

    assert_eq!(q.scheduled_front(0), Some(t(2)));
    assert_eq!(q.scheduled_threads(0), vec![t(2), t(4), t(1), t(3)]);
    assert_eq!(q.scheduled_at(0, 30), vec![t(1), t(3)]);
    assert_eq!(q.scheduled_next(0, t(4)), Some(t(1)));
    assert_eq!(q.scheduled_next(0, t(3)), None);
}

#[test]
fn test_queue_push_front() {
    let mut q = PriorityQueue::new(1);
    let one = AffinityMask::single(0);
    q.push_back(t(1), placed(20, Some(0), one));
    q.push_front(t(2), placed(20, Some(0), one));
    assert_eq!(q.scheduled_at(0, 20), vec![t(2), t(1)]);
}

#[test]
fn test_queue_move_to_back_returns_new_front() {
    let mut q = PriorityQueue::new(1);
    let one = AffinityMask::single(0);
    q.push_back(t(1), placed(20, Some(0), one));
    q.push_back(t(2), placed(20, Some(0), one));

    assert_eq!(q.move_to_scheduled_back(t(1)), Some(t(2)));
    assert_eq!(q.scheduled_at(0, 20), vec![t(2), t(1)]);

    q.move_to_scheduled_front(t(1));
    assert_eq!(q.scheduled_front(0), Some(t(1)));
}

#[test]
fn test_queue_lone_thread_stays_front_after_rotation() {
    let mut q = PriorityQueue::new(1);
    q.push_back(t(1), placed(20, Some(0), AffinityMask::single(0)));
    assert_eq!(q.move_to_scheduled_back(t(1)), Some(t(1)));
}

#[test]
fn test_queue_remove_returns_placement() {
    let mut q = PriorityQueue::new(2);
    let p = placed(5, Some(1), AffinityMask::all(2));
    q.push_back(t(7), p);
    assert!(q.contains(t(7)));
    assert_eq!(q.remove(t(7)), p);
    assert!(!q.contains(t(7)));
    assert!(!q.is_suggested_on(t(7), 0));
    assert_eq!(q.scheduled_front(1), None);
}

// ============================================================================
// Suggestions
// ============================================================================

#[test]
fn test_queue_suggested_on_other_allowed_cores() {
    let mut q = PriorityQueue::new(3);
    q.push_back(t(1), placed(20, Some(0), AffinityMask::from_bits(0b011)));

    assert!(q.is_scheduled_on(t(1), 0));
    assert!(!q.is_suggested_on(t(1), 0));
    assert!(q.is_suggested_on(t(1), 1));
    assert!(!q.is_suggested_on(t(1), 2));
    assert_eq!(q.suggested_front(1), Some(t(1)));
}

#[test]
fn test_queue_change_core_swaps_roles() {
    let mut q = PriorityQueue::new(2);
    q.push_back(t(1), placed(20, Some(0), AffinityMask::all(2)));
    q.change_core(t(1), Some(1), false);

    assert!(q.is_scheduled_on(t(1), 1));
    assert!(q.is_suggested_on(t(1), 0));
    assert!(!q.is_suggested_on(t(1), 1));
    assert_eq!(q.placement(t(1)).and_then(|p| p.active_core), Some(1));
}

#[test]
fn test_queue_suggestion_only_thread() {
    let mut q = PriorityQueue::new(2);
    q.push_back(t(1), placed(20, Some(0), AffinityMask::all(2)));
    q.move_to_suggested_queue(t(1));

    assert_eq!(q.scheduled_front(0), None);
    assert!(q.is_suggested_on(t(1), 0));
    assert!(q.is_suggested_on(t(1), 1));

    assert_eq!(q.pop_from_suggested_queue(1), Some(t(1)));
    assert!(q.is_scheduled_on(t(1), 1));
    assert!(!q.is_suggested_on(t(1), 1));
}

#[test]
fn test_queue_suggested_walk_crosses_levels() {
    let mut q = PriorityQueue::new(2);
    let all = AffinityMask::all(2);
    q.push_back(t(1), placed(10, Some(0), all));
    q.push_back(t(2), placed(10, Some(0), all));
    q.push_back(t(3), placed(40, Some(0), all));

    assert_eq!(q.suggested_front(1), Some(t(1)));
    assert_eq!(q.suggested_same_priority_next(1, t(1)), Some(t(2)));
    assert_eq!(q.suggested_same_priority_next(1, t(2)), None);
    assert_eq!(q.suggested_next(1, t(2)), Some(t(3)));
    assert_eq!(q.suggested_front_at(1, 40), Some(t(3)));
}

// ============================================================================
// Re-levelling
// ============================================================================

#[test]
fn test_queue_priority_change_running_keeps_front() {
    let mut q = PriorityQueue::new(1);
    let one = AffinityMask::single(0);
    q.push_back(t(1), placed(20, Some(0), one));
    q.push_back(t(2), placed(10, Some(0), one));
    q.push_back(t(3), placed(30, Some(0), one));

    q.change_priority(t(1), 10, true);
    assert_eq!(q.scheduled_at(0, 10), vec![t(1), t(2)]);

    q.change_priority(t(3), 10, false);
    assert_eq!(q.scheduled_at(0, 10), vec![t(1), t(2), t(3)]);
    assert!(q.scheduled_at(0, 20).is_empty());
}

#[test]
fn test_queue_affinity_change_moves_suggestions() {
    let mut q = PriorityQueue::new(3);
    q.push_back(t(1), placed(20, Some(0), AffinityMask::from_bits(0b011)));
    q.change_affinity_mask(t(1), Some(2), AffinityMask::from_bits(0b110));

    assert!(q.is_scheduled_on(t(1), 2));
    assert!(q.is_suggested_on(t(1), 1));
    assert!(!q.is_suggested_on(t(1), 0));
    assert!(!q.is_scheduled_on(t(1), 0));
}

// ============================================================================
// Misuse
// ============================================================================

#[test]
#[should_panic]
fn test_queue_double_push_panics() {
    let mut q = PriorityQueue::new(1);
    let p = placed(20, Some(0), AffinityMask::single(0));
    q.push_back(t(1), p);
    q.push_back(t(1), p);
}

#[test]
#[should_panic]
fn test_queue_active_core_outside_mask_panics() {
    let mut q = PriorityQueue::new(2);
    q.push_back(t(1), placed(20, Some(1), AffinityMask::single(0)));
}

#[test]
#[should_panic]
fn test_queue_remove_unqueued_panics() {
    let mut q = PriorityQueue::new(1);
    q.remove(t(3));
}
