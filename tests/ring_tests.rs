//! Integration coverage for the Ring invariant (spec invariant 1) and
//! scenario S5, exercised through the public API.

use sentryprof::ring::Ring;

#[test]
fn invariant_1_avg_is_floor_of_mean_over_last_min_cap_n() {
    let mut ring = Ring::new(5);
    assert_eq!(ring.avg(), 0);

    for value in [2, 4, 6] {
        ring.push(value);
    }
    // n=3 < cap=5: avg over all 3.
    assert_eq!(ring.avg(), 4);

    for value in [8, 10, 12] {
        ring.push(value);
    }
    // n=6 > cap=5: avg over the last 5 pushed (4,6,8,10,12).
    assert_eq!(ring.avg(), (4 + 6 + 8 + 10 + 12) / 5);
}

#[test]
fn invariant_1_zero_capacity_ring_is_permanently_inert() {
    let mut ring = Ring::new(0);
    for value in 0..1000 {
        ring.push(value);
    }
    assert_eq!(ring.avg(), 0);
    assert!(ring.snapshot().is_empty());
}

#[test]
fn s5_ring_order_small_then_wraparound() {
    let mut ring = Ring::new(10);
    ring.push(1);
    ring.push(2);
    ring.push(3);
    assert_eq!(ring.avg(), 2);
    assert_eq!(ring.snapshot(), vec![1, 2, 3]);

    for i in 4..=15 {
        ring.push(i);
    }
    assert_eq!(ring.avg(), 10);
    assert_eq!(ring.snapshot(), (6..=15).collect::<Vec<_>>());
}
