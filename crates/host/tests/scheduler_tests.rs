//! Frame scheduler integration tests
//!
//! Covers:
//! - Reservation shape for high-speed interrupt endpoints (bInterval 7 and 8)
//! - Ceiling enforcement for high-bandwidth isochronous endpoints
//! - Deterministic placement and capacity reuse after release
//! - Capacity invariant under random admit/release sequences (property based)
//!
//! Run with: `cargo test -p host --test scheduler_tests`

use common::Error;
use host::{BandwidthRequest, Scheduler, SchedulerSettings};
use proptest::prelude::*;
use protocol::{DeviceSpeed, EndpointDescriptor};

// ============================================================================
// Test Utilities
// ============================================================================

fn endpoint(address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        attributes,
        max_packet_size,
        interval,
    }
}

/// 1000-byte isochronous IN, three transactions per microframe
fn high_bandwidth_iso() -> EndpointDescriptor {
    endpoint(0x81, 0x05, 1000 | (2 << 11), 1)
}

fn busy_slots(scheduler: &Scheduler) -> Vec<(u32, u32)> {
    let settings = scheduler.settings().clone();
    let mut busy = Vec::new();
    for frame in 0..settings.frames {
        for sub in 0..settings.sub_frames {
            if scheduler.slot_load(frame, sub) > 0 {
                busy.push((frame, sub));
            }
        }
    }
    busy
}

// ============================================================================
// Reservation shape
// ============================================================================

/// High-speed bInterval 7: 2^6 microframes, one slot every 8th frame
#[test]
fn test_interrupt_every_eighth_frame() {
    let scheduler = Scheduler::new(SchedulerSettings::ehci());
    let handle = scheduler
        .admit_endpoint(&endpoint(0x81, 0x03, 64, 7), DeviceSpeed::High)
        .unwrap();

    let reservation = scheduler.reservation(handle).unwrap();
    assert_eq!(reservation.request.frame_period, 8);

    let busy = busy_slots(&scheduler);
    assert_eq!(busy.len(), 1024 / 8);
    let (first_frame, first_sub) = busy[0];
    for (frame, sub) in &busy {
        assert_eq!(frame % 8, first_frame % 8);
        assert_eq!(*sub, first_sub);
    }
}

#[test]
fn test_interval_eight_is_every_sixteenth_frame() {
    let scheduler = Scheduler::new(SchedulerSettings::ehci());
    let handle = scheduler
        .admit_endpoint(&endpoint(0x81, 0x03, 64, 8), DeviceSpeed::High)
        .unwrap();

    // 2^7 = 128 microframes
    let reservation = scheduler.reservation(handle).unwrap();
    assert_eq!(reservation.request.frame_period, 16);
    assert_eq!(reservation.request.sub_frame_period, 8);

    let busy = busy_slots(&scheduler);
    assert_eq!(busy.len(), 1024 / 16);
    assert!(busy.iter().all(|(frame, _)| frame % 16 == busy[0].0 % 16));
}

#[test]
fn test_second_half_frame_iso_rejected() {
    let scheduler = Scheduler::new(SchedulerSettings::ehci());
    let request = BandwidthRequest::for_endpoint(
        &high_bandwidth_iso(),
        DeviceSpeed::High,
        scheduler.settings(),
    )
    .unwrap();
    assert_eq!(request.slot_cost, 3114);
    assert!(request.slot_cost * 2 > scheduler.slot_ceiling());

    let first = scheduler
        .admit_endpoint(&high_bandwidth_iso(), DeviceSpeed::High)
        .unwrap();
    let err = scheduler
        .admit_endpoint(&endpoint(0x82, 0x05, 1000 | (2 << 11), 1), DeviceSpeed::High)
        .unwrap_err();

    match err {
        Error::InsufficientBandwidth {
            required,
            available,
        } => {
            assert_eq!(required, 3114);
            assert_eq!(available, scheduler.slot_ceiling() - 3114);
        }
        other => panic!("expected InsufficientBandwidth, got {:?}", other),
    }
    // The failed admission charged nothing
    assert_eq!(scheduler.reservation_count(), 1);
    assert_eq!(scheduler.stats().peak_slot, 3114);

    scheduler.release(first).unwrap();
    assert!(scheduler
        .admit_endpoint(&high_bandwidth_iso(), DeviceSpeed::High)
        .is_ok());
}

#[test]
fn test_full_speed_controller() {
    let scheduler = Scheduler::new(SchedulerSettings::uhci());
    // 64-byte interrupt every 32 frames: 77 byte-times
    let handle = scheduler
        .admit_endpoint(&endpoint(0x81, 0x03, 64, 32), DeviceSpeed::Full)
        .unwrap();
    let reservation = scheduler.reservation(handle).unwrap();
    assert_eq!(reservation.request.frame_period, 32);
    assert_eq!(reservation.request.slot_cost, 77);
    assert_eq!(busy_slots(&scheduler).len(), 1024 / 32);
}

#[test]
fn test_bulk_endpoint_not_schedulable() {
    let scheduler = Scheduler::new(SchedulerSettings::ehci());
    let err = scheduler
        .admit_endpoint(&endpoint(0x81, 0x02, 512, 0), DeviceSpeed::High)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInterval { .. }));
    assert_eq!(scheduler.reservation_count(), 0);
}

// ============================================================================
// Placement
// ============================================================================

#[test]
fn test_placement_is_deterministic() {
    let requests = [
        BandwidthRequest::new(8, 8, 500),
        BandwidthRequest::new(4, 8, 900),
        BandwidthRequest::new(8, 2, 120),
        BandwidthRequest::new(1, 8, 300),
    ];

    let place = || {
        let scheduler = Scheduler::new(SchedulerSettings::ehci());
        requests
            .iter()
            .map(|r| {
                let handle = scheduler.admit(*r).unwrap();
                let placed = scheduler.reservation(handle).unwrap();
                (placed.frame_phase, placed.sub_frame_phase)
            })
            .collect::<Vec<_>>()
    };

    assert_eq!(place(), place());
}

#[test]
fn test_fills_every_phase_before_stacking() {
    let scheduler = Scheduler::new(SchedulerSettings::ehci());
    let request = BandwidthRequest::new(8, 1, 1000);

    // Whole frames every 8th frame: 8 disjoint patterns
    let mut phases: Vec<u32> = (0..8)
        .map(|_| {
            let handle = scheduler.admit(request).unwrap();
            scheduler.reservation(handle).unwrap().frame_phase
        })
        .collect();
    phases.sort();
    assert_eq!(phases, (0..8).collect::<Vec<_>>());
    assert_eq!(scheduler.stats().peak_slot, 1000);
}

#[test]
fn test_exact_ceiling_admitted() {
    let scheduler = Scheduler::new(SchedulerSettings::ehci());
    let ceiling = scheduler.slot_ceiling();
    scheduler.admit(BandwidthRequest::new(1, 1, ceiling)).unwrap();
    assert!(matches!(
        scheduler.admit(BandwidthRequest::new(1, 1, 1)),
        Err(Error::InsufficientBandwidth {
            required: 1,
            available: 0
        })
    ));
}

// ============================================================================
// Capacity invariant
// ============================================================================

fn small_settings() -> SchedulerSettings {
    SchedulerSettings {
        frames: 16,
        sub_frames: 4,
        slot_capacity: 1000,
        ceiling_percent: 80,
    }
}

fn request_strategy() -> impl Strategy<Value = BandwidthRequest> {
    (0u32..=4, 0u32..=2, 1u32..=500)
        .prop_map(|(f, s, cost)| BandwidthRequest::new(1 << f, 1 << s, cost))
}

proptest! {
    #[test]
    fn prop_slots_never_exceed_ceiling(
        ops in prop::collection::vec((request_strategy(), any::<bool>()), 1..60)
    ) {
        let scheduler = Scheduler::new(small_settings());
        let mut held = Vec::new();

        for (request, release) in ops {
            if release && !held.is_empty() {
                let handle = held.remove(0);
                prop_assert!(scheduler.release(handle).is_ok());
            } else if let Ok(handle) = scheduler.admit(request) {
                held.push(handle);
            }

            for frame in 0..16 {
                prop_assert!(scheduler.frame_load(frame) <= scheduler.frame_ceiling());
                for sub in 0..4 {
                    prop_assert!(scheduler.slot_load(frame, sub) <= scheduler.slot_ceiling());
                }
            }
        }

        for handle in held {
            prop_assert!(scheduler.release(handle).is_ok());
        }
        prop_assert_eq!(scheduler.stats().reserved, 0);
        prop_assert_eq!(scheduler.reservation_count(), 0);
    }

    #[test]
    fn prop_rejection_leaves_tallies_untouched(
        filler in request_strategy(),
        request in request_strategy(),
    ) {
        let scheduler = Scheduler::new(small_settings());
        while scheduler.admit(filler).is_ok() {}

        let before = scheduler.stats();
        if scheduler.admit(request).is_err() {
            prop_assert_eq!(scheduler.stats(), before);
        }
    }
}
