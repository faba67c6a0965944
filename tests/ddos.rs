//! Abuse-score tests: decay arithmetic, ban lifecycle, and the fresh-start
//! reset on ban expiry.

use peercore::{DdosFilter, DdosScore};
use std::thread;
use std::time::Duration;

#[test]
fn score_accumulates_and_reads_back() {
    let score = DdosScore::new();
    assert_eq!(score.score(), 0);

    score.add(3);
    score.add(2);
    assert_eq!(score.score(), 5);

    score.reset();
    assert_eq!(score.score(), 0);
}

#[test]
fn score_decays_one_point_per_second() {
    let score = DdosScore::new();
    score.add(3);

    thread::sleep(Duration::from_millis(1100));
    assert_eq!(score.score(), 2);
}

#[test]
fn score_never_decays_below_zero() {
    let score = DdosScore::new();
    score.add(1);

    thread::sleep(Duration::from_millis(2100));
    assert_eq!(score.score(), 0);

    // Further reads after full decay stay at zero.
    thread::sleep(Duration::from_millis(1100));
    assert_eq!(score.score(), 0);
}

#[test]
fn ban_is_in_force_until_expiry() {
    let filter = DdosFilter::new();
    assert!(!filter.banned());

    filter.ban(Duration::from_millis(100));
    assert!(filter.banned());
    assert!(filter.banned());

    thread::sleep(Duration::from_millis(150));
    assert!(!filter.banned());
}

#[test]
fn expired_ban_resets_both_scores() {
    let filter = DdosFilter::new();
    filter.r_score.add(10);
    filter.c_score.add(4);
    filter.ban(Duration::from_millis(50));

    thread::sleep(Duration::from_millis(100));
    assert!(!filter.banned());
    assert_eq!(filter.r_score.score(), 0);
    assert_eq!(filter.c_score.score(), 0);
}

#[test]
fn renewed_ban_extends_the_deadline() {
    let filter = DdosFilter::new();
    filter.ban(Duration::from_millis(50));
    thread::sleep(Duration::from_millis(30));
    filter.ban(Duration::from_millis(200));

    // The first deadline has passed; the renewal keeps the ban alive.
    thread::sleep(Duration::from_millis(50));
    assert!(filter.banned());
}
