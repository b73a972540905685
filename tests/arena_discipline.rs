// Arena discipline: marks rewind in LIFO order, reservations and
// exhaustion leave the cursors where the contract says.

use proptest::prelude::*;
use thinlisp::arena::{ArenaError, Bistack, Direction};

#[test]
fn test_alloc_past_free_fails_without_moving() {
    let mut arena = Bistack::new(256).unwrap();
    arena.alloc_forward(10).unwrap();
    let (forward, backward) = (arena.forward(), arena.backward());
    let free = arena.free() as usize;
    assert!(matches!(
        arena.alloc_forward(free + 1),
        Err(ArenaError::OutOfMemory { .. })
    ));
    assert!(matches!(
        arena.alloc_backward(free + 1),
        Err(ArenaError::OutOfMemory { .. })
    ));
    assert_eq!((arena.forward(), arena.backward()), (forward, backward));
    // exactly the free space still fits
    arena.alloc_forward(free).unwrap();
    assert_eq!(arena.free(), 0);
}

#[test]
fn test_wrong_mark_is_rejected() {
    let mut arena = Bistack::new(256).unwrap();
    let outer = arena.mark_forward().unwrap();
    arena.alloc_forward(4).unwrap();
    let inner = arena.mark_forward().unwrap();
    assert_eq!(arena.rewind(outer), Err(ArenaError::MarkMismatch));
    arena.rewind(inner).unwrap();
    assert_eq!(arena.stats().forward_marks, 1);
}

#[test]
fn test_regions_are_independent() {
    let mut arena = Bistack::new(256).unwrap();
    let low = arena.mark_forward().unwrap();
    let high = arena.mark_backward().unwrap();
    arena.alloc_forward(20).unwrap();
    arena.alloc_backward(30).unwrap();
    arena.rewind(low).unwrap();
    assert_eq!(arena.stats().forward_used, 0);
    assert!(arena.stats().backward_used >= 30);
    arena.rewind(high).unwrap();
    assert_eq!(arena.backward(), arena.capacity());
}

#[test]
fn test_direction_selects_region() {
    let mut arena = Bistack::new(256).unwrap();
    arena.push_direction(Direction::Backward).unwrap();
    let span = arena.alloc(8).unwrap();
    assert_eq!(span.offset, arena.backward());
    assert_eq!(arena.pop_direction().unwrap(), Direction::Backward);
    let span = arena.alloc(8).unwrap();
    assert_eq!(span.end(), arena.forward());
}

#[test]
fn test_reservation_blocks_forward_growth() {
    let mut arena = Bistack::new(256).unwrap();
    let lock = arena.lock().unwrap();
    let start = arena.forward();
    let room = arena.reserve(&lock, 63).unwrap();
    assert_eq!(room.offset, start);
    assert_eq!(arena.alloc_forward(1), Err(ArenaError::Locked));
    arena.bytes_mut(room.offset, 3).unwrap().copy_from_slice(b"abc");
    arena.claim(&lock, 3).unwrap();
    arena.unlock(lock).unwrap();
    assert_eq!(arena.forward(), start + 3);
    assert_eq!(arena.bytes(start, 3).unwrap(), b"abc");
}

proptest! {
    #[test]
    fn prop_marks_rewind_lifo(sizes in prop::collection::vec(0usize..24, 1..12)) {
        let mut arena = Bistack::new(1024).unwrap();
        let mut marks = Vec::new();
        for &n in &sizes {
            let before = arena.forward();
            marks.push((arena.mark_forward().unwrap(), before));
            arena.alloc_forward(n).unwrap();
        }
        while let Some((mark, before)) = marks.pop() {
            arena.rewind(mark).unwrap();
            prop_assert_eq!(arena.forward(), before);
        }
        prop_assert_eq!(arena.stats().forward_marks, 0);
    }

    #[test]
    fn prop_reserve_then_claim(sizes in prop::collection::vec(1usize..100, 1..5), keep in 0usize..100) {
        let mut arena = Bistack::new(512).unwrap();
        arena.alloc_forward(7).unwrap();
        let start = arena.forward();
        let lock = arena.lock().unwrap();
        // re-reserving resizes the same reservation
        for &n in &sizes {
            prop_assert_eq!(arena.reserve(&lock, n).unwrap().offset, start);
        }
        let last = *sizes.last().unwrap();
        let keep = keep.min(last);
        let claimed = arena.claim(&lock, keep).unwrap();
        prop_assert_eq!(claimed.offset, start);
        arena.unlock(lock).unwrap();
        prop_assert_eq!(arena.forward() as usize, start as usize + keep);
    }

    #[test]
    fn prop_checkpoint_restores_both_ends(front in 0usize..200, back in 0usize..200) {
        let mut arena = Bistack::new(1024).unwrap();
        let checkpoint = arena.checkpoint();
        arena.alloc_forward(front).unwrap();
        let _mark = arena.mark_backward().unwrap();
        arena.alloc_backward(back).unwrap();
        arena.restore(&checkpoint).unwrap();
        prop_assert_eq!(arena.checkpoint(), checkpoint);
    }
}
