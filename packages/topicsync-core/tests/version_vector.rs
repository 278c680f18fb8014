use topicsync_core::VersionVector;
use topicsync_test_support::replica;

#[test]
fn holes_are_not_hidden_by_later_counters() {
    let a = replica("a");
    let mut vv = VersionVector::new();
    vv.observe(&a, 1);
    vv.observe(&a, 3);
    assert!(vv.contains(&a, 3));
    assert!(!vv.contains(&a, 2));
    assert_eq!(vv.frontier(&a), 1);
    assert_eq!(vv.get(&a), 3);

    vv.observe(&a, 2);
    assert_eq!(vv.frontier(&a), 3);
}

#[test]
fn merge_and_awareness() {
    let a = replica("a");
    let b = replica("b");
    let mut left = VersionVector::new();
    left.observe(&a, 1);
    left.observe(&a, 2);
    let mut right = VersionVector::new();
    right.observe(&b, 1);

    assert!(!left.is_aware_of(&right));
    left.merge(&right);
    assert!(left.is_aware_of(&right));
    assert!(!right.is_aware_of(&left));
    assert_eq!(left.replicas().count(), 2);
    assert!(VersionVector::new().is_aware_of(&VersionVector::new()));
}

#[test]
fn serde_round_trip_keeps_ranges() {
    let a = replica("a");
    let mut vv = VersionVector::new();
    vv.observe(&a, 1);
    vv.observe(&a, 5);
    let json = serde_json::to_string(&vv).unwrap();
    let back: VersionVector = serde_json::from_str(&json).unwrap();
    assert_eq!(back, vv);
    assert!(!back.contains(&a, 3));
}
