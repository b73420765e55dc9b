//! Periodic frame scheduler
//!
//! Admission control for interrupt and isochronous endpoints. The schedule
//! is a circular list of `frames` frames, each split into `sub_frames`
//! slots; every slot carries a tally of reserved byte-times that must stay
//! at or below the slot ceiling, which keeps every frame at or below the
//! frame ceiling.
//!
//! A reservation targets one slot pattern: every `frame_period`-th frame
//! starting at `frame_phase`, and within each of those frames every
//! `sub_frame_period`-th slot starting at `sub_frame_phase`. Placement picks
//! the pattern whose busiest slot is least loaded. Candidates are tried in
//! ascending frame phase, then ascending sub-frame phase, and the first one
//! wins a tie, so the same sequence of admissions always yields the same
//! schedule.
//!
//! Admission and release are serialized by one lock. Load queries read the
//! slot tallies directly and may observe an admission in progress.

use crate::config::SchedulerSettings;
use crate::lock;
use common::{Error, Result};
use protocol::{DeviceSpeed, EndpointDescriptor, EndpointType, ScheduleHandle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace};

/// High-speed byte-times in one 1 ms frame
const HS_FRAME_BYTES: u64 = 60_000;
/// Full-speed byte-times in one 1 ms frame
const FS_FRAME_BYTES: u64 = 1_500;
/// Microframes per frame
const MICROFRAMES: u32 = 8;

/// Per-transaction protocol overhead in byte-times (USB 2.0 §5.11.3)
const HS_ISO_OVERHEAD: u64 = 38;
const HS_INTERRUPT_OVERHEAD: u64 = 55;
const FS_ISO_OVERHEAD: u64 = 9;
const FS_INTERRUPT_OVERHEAD: u64 = 13;
const LS_INTERRUPT_OVERHEAD: u64 = 13;
/// A low-speed byte occupies eight full-speed byte-times
const LS_BYTE_FACTOR: u64 = 8;

/// Shape and size of one periodic reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BandwidthRequest {
    /// Reserve every Nth frame; power of two, at most the frame count
    pub frame_period: u32,
    /// Within a targeted frame, every Nth slot; power of two, at most `sub_frames`
    pub sub_frame_period: u32,
    /// Byte-times consumed in each targeted slot
    pub slot_cost: u32,
}

impl BandwidthRequest {
    pub fn new(frame_period: u32, sub_frame_period: u32, slot_cost: u32) -> Self {
        Self {
            frame_period,
            sub_frame_period,
            slot_cost,
        }
    }

    /// Derive the request for a periodic endpoint at `speed`
    pub fn for_endpoint(
        endpoint: &EndpointDescriptor,
        speed: DeviceSpeed,
        settings: &SchedulerSettings,
    ) -> Result<Self> {
        let kind = endpoint.transfer_type();
        let interval = u32::from(endpoint.interval);
        let invalid = || Error::InvalidInterval {
            interval,
            frames: settings.frames,
        };
        if !kind.is_periodic() || interval == 0 {
            return Err(invalid());
        }

        let payload = u64::from(endpoint.payload_size());
        let slot_budget = u64::from(settings.slot_capacity);
        let sub_frames = settings.sub_frames;

        if speed.uses_microframes() {
            if interval > 16 {
                return Err(invalid());
            }
            let microframes = 1u32 << (interval - 1);
            // Microframes covered by one slot
            let per_slot = (MICROFRAMES / sub_frames).max(1);
            let period = (microframes / per_slot).max(1);
            let (frame_period, sub_frame_period) = if period < sub_frames {
                (1, period)
            } else {
                (period / sub_frames, sub_frames)
            };
            let transactions = u64::from((per_slot / microframes).max(1));

            let overhead = match kind {
                EndpointType::Isochronous => HS_ISO_OVERHEAD,
                _ => HS_INTERRUPT_OVERHEAD,
            };
            let mult = u64::from(endpoint.transactions_per_microframe());
            let bytes = (payload + overhead) * mult * transactions;
            let cost = (bytes * slot_budget * u64::from(sub_frames)).div_ceil(HS_FRAME_BYTES);

            Ok(Self::new(
                frame_period.min(settings.frames),
                sub_frame_period,
                saturate(cost),
            ))
        } else {
            let frames = match kind {
                EndpointType::Isochronous => {
                    if interval > 16 {
                        return Err(invalid());
                    }
                    1u32 << (interval - 1)
                }
                // Largest power of two not above bInterval
                _ => 1u32 << interval.ilog2(),
            };

            let bytes = match speed {
                DeviceSpeed::Low => (payload + LS_INTERRUPT_OVERHEAD) * LS_BYTE_FACTOR,
                _ if kind == EndpointType::Isochronous => payload + FS_ISO_OVERHEAD,
                _ => payload + FS_INTERRUPT_OVERHEAD,
            };
            // Spread over every slot of the frame
            let cost = (bytes * slot_budget).div_ceil(FS_FRAME_BYTES);

            Ok(Self::new(frames.min(settings.frames), 1, saturate(cost)))
        }
    }
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Slot pattern granted to one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub request: BandwidthRequest,
    pub frame_phase: u32,
    pub sub_frame_phase: u32,
}

impl Reservation {
    /// Targeted frame indices, ascending
    pub fn frames(&self, frames: u32) -> impl Iterator<Item = u32> + '_ {
        (self.frame_phase..frames).step_by(self.request.frame_period as usize)
    }

    /// Targeted sub-frame indices within each targeted frame
    pub fn sub_frames(&self, sub_frames: u32) -> impl Iterator<Item = u32> + '_ {
        (self.sub_frame_phase..sub_frames).step_by(self.request.sub_frame_period as usize)
    }
}

/// Snapshot of schedule occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleStats {
    pub reservations: usize,
    /// Sum over every slot
    pub reserved: u64,
    /// Heaviest single slot
    pub peak_slot: u32,
    pub slot_ceiling: u32,
    pub frame_ceiling: u32,
}

pub struct Scheduler {
    settings: SchedulerSettings,
    /// frames × sub_frames tallies, frame-major
    slots: Vec<AtomicU32>,
    reservations: Mutex<HashMap<ScheduleHandle, Reservation>>,
    next_handle: AtomicU64,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        let count = (settings.frames * settings.sub_frames) as usize;
        Self {
            slots: (0..count).map(|_| AtomicU32::new(0)).collect(),
            settings,
            reservations: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn slot_ceiling(&self) -> u32 {
        self.settings.slot_ceiling()
    }

    pub fn frame_ceiling(&self) -> u32 {
        self.settings.frame_ceiling()
    }

    /// Reserve bandwidth for one periodic endpoint
    pub fn admit_endpoint(
        &self,
        endpoint: &EndpointDescriptor,
        speed: DeviceSpeed,
    ) -> Result<ScheduleHandle> {
        let request = BandwidthRequest::for_endpoint(endpoint, speed, &self.settings)?;
        let handle = self.admit(request)?;
        debug!(
            "Admitted endpoint {:#04x} ({}, bInterval {}) as {}: every {} frame(s), cost {}",
            endpoint.address,
            speed,
            endpoint.interval,
            handle,
            request.frame_period,
            request.slot_cost
        );
        Ok(handle)
    }

    /// Place `request` on the least-loaded matching slot pattern
    ///
    /// Either every targeted slot is charged or none is.
    pub fn admit(&self, request: BandwidthRequest) -> Result<ScheduleHandle> {
        self.check_shape(&request)?;
        let ceiling = self.slot_ceiling();

        let mut reservations = lock(&self.reservations);

        let mut best: Option<(u32, Reservation)> = None;
        for frame_phase in 0..request.frame_period {
            for sub_frame_phase in 0..request.sub_frame_period {
                let candidate = Reservation {
                    request,
                    frame_phase,
                    sub_frame_phase,
                };
                let score = self.peak_over(&candidate);
                if best.is_none_or(|(s, _)| score < s) {
                    best = Some((score, candidate));
                }
            }
        }

        let Some((score, placement)) = best else {
            return Err(Error::InvalidInterval {
                interval: request.frame_period,
                frames: self.settings.frames,
            });
        };
        if u64::from(score) + u64::from(request.slot_cost) > u64::from(ceiling) {
            trace!(
                "Rejecting {} byte-times per slot: best pattern already at {} of {}",
                request.slot_cost, score, ceiling
            );
            return Err(Error::InsufficientBandwidth {
                required: request.slot_cost,
                available: ceiling.saturating_sub(score),
            });
        }

        for index in self.slot_indices(&placement) {
            self.slots[index].fetch_add(request.slot_cost, Ordering::Relaxed);
        }
        let handle = ScheduleHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        reservations.insert(handle, placement);
        Ok(handle)
    }

    /// Return a reservation's bandwidth
    ///
    /// Unknown and already-released handles fail with `InvalidHandle` and
    /// leave the tallies untouched.
    pub fn release(&self, handle: ScheduleHandle) -> Result<()> {
        let mut reservations = lock(&self.reservations);
        let placement = reservations
            .remove(&handle)
            .ok_or(Error::InvalidHandle(handle))?;
        for index in self.slot_indices(&placement) {
            self.slots[index].fetch_sub(placement.request.slot_cost, Ordering::Relaxed);
        }
        trace!("Released {}", handle);
        Ok(())
    }

    pub fn reservation(&self, handle: ScheduleHandle) -> Option<Reservation> {
        lock(&self.reservations).get(&handle).copied()
    }

    pub fn reservation_count(&self) -> usize {
        lock(&self.reservations).len()
    }

    /// Load of one (frame, sub-frame) slot; indices wrap
    pub fn slot_load(&self, frame: u32, sub_frame: u32) -> u32 {
        let frame = frame % self.settings.frames;
        let sub_frame = sub_frame % self.settings.sub_frames;
        self.slots[(frame * self.settings.sub_frames + sub_frame) as usize].load(Ordering::Relaxed)
    }

    /// Total load of one frame; index wraps
    pub fn frame_load(&self, frame: u32) -> u32 {
        (0..self.settings.sub_frames)
            .map(|sub| self.slot_load(frame, sub))
            .sum()
    }

    pub fn stats(&self) -> ScheduleStats {
        let loads = self.slots.iter().map(|s| s.load(Ordering::Relaxed));
        let (reserved, peak_slot) = loads.fold((0u64, 0u32), |(sum, peak), load| {
            (sum + u64::from(load), peak.max(load))
        });
        ScheduleStats {
            reservations: self.reservation_count(),
            reserved,
            peak_slot,
            slot_ceiling: self.slot_ceiling(),
            frame_ceiling: self.frame_ceiling(),
        }
    }

    fn check_shape(&self, request: &BandwidthRequest) -> Result<()> {
        let valid = request.frame_period.is_power_of_two()
            && request.frame_period <= self.settings.frames
            && request.sub_frame_period.is_power_of_two()
            && request.sub_frame_period <= self.settings.sub_frames;
        if !valid {
            return Err(Error::InvalidInterval {
                interval: request.frame_period,
                frames: self.settings.frames,
            });
        }
        Ok(())
    }

    fn slot_indices(&self, placement: &Reservation) -> Vec<usize> {
        let sub_frames = self.settings.sub_frames;
        placement
            .frames(self.settings.frames)
            .flat_map(|frame| {
                placement
                    .sub_frames(sub_frames)
                    .map(move |sub| (frame * sub_frames + sub) as usize)
            })
            .collect()
    }

    fn peak_over(&self, placement: &Reservation) -> u32 {
        self.slot_indices(placement)
            .into_iter()
            .map(|i| self.slots[i].load(Ordering::Relaxed))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(
        address: u8,
        attributes: u8,
        max_packet_size: u16,
        interval: u8,
    ) -> EndpointDescriptor {
        EndpointDescriptor {
            address,
            attributes,
            max_packet_size,
            interval,
        }
    }

    #[test]
    fn test_high_speed_interval_decoding() {
        let settings = SchedulerSettings::ehci();

        // 2^(7-1) = 64 microframes = every 8th frame, one slot each
        let req = BandwidthRequest::for_endpoint(
            &endpoint(0x81, 0x03, 64, 7),
            DeviceSpeed::High,
            &settings,
        )
        .unwrap();
        assert_eq!((req.frame_period, req.sub_frame_period), (8, 8));
        assert_eq!(req.slot_cost, 64 + 55);

        // Every microframe
        let req = BandwidthRequest::for_endpoint(
            &endpoint(0x81, 0x01, 1024, 1),
            DeviceSpeed::High,
            &settings,
        )
        .unwrap();
        assert_eq!((req.frame_period, req.sub_frame_period), (1, 1));

        // Every 4th microframe
        let req = BandwidthRequest::for_endpoint(
            &endpoint(0x81, 0x03, 8, 3),
            DeviceSpeed::High,
            &settings,
        )
        .unwrap();
        assert_eq!((req.frame_period, req.sub_frame_period), (1, 4));
    }

    #[test]
    fn test_full_speed_interval_rounds_down() {
        let settings = SchedulerSettings::uhci();
        let req = BandwidthRequest::for_endpoint(
            &endpoint(0x81, 0x03, 8, 10),
            DeviceSpeed::Full,
            &settings,
        )
        .unwrap();
        assert_eq!(req.frame_period, 8);
        assert_eq!(req.slot_cost, 8 + 13);

        let req = BandwidthRequest::for_endpoint(
            &endpoint(0x81, 0x03, 8, 255),
            DeviceSpeed::Low,
            &settings,
        )
        .unwrap();
        assert_eq!(req.frame_period, 128);
        assert_eq!(req.slot_cost, (8 + 13) * 8);
    }

    #[test]
    fn test_interval_clamped_to_frame_list() {
        let settings = SchedulerSettings {
            frames: 16,
            ..SchedulerSettings::ehci()
        };
        let req = BandwidthRequest::for_endpoint(
            &endpoint(0x81, 0x03, 8, 16),
            DeviceSpeed::High,
            &settings,
        )
        .unwrap();
        assert_eq!(req.frame_period, 16);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let settings = SchedulerSettings::ehci();
        let err = BandwidthRequest::for_endpoint(
            &endpoint(0x81, 0x03, 8, 0),
            DeviceSpeed::Full,
            &settings,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInterval { interval: 0, .. }));

        let err = BandwidthRequest::for_endpoint(
            &endpoint(0x02, 0x02, 512, 1),
            DeviceSpeed::High,
            &settings,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInterval { .. }));
    }

    #[test]
    fn test_least_loaded_placement_spreads() {
        let scheduler = Scheduler::new(SchedulerSettings::uhci());
        let request = BandwidthRequest::new(4, 1, 100);

        let phases: Vec<u32> = (0..4)
            .map(|_| {
                let h = scheduler.admit(request).unwrap();
                scheduler.reservation(h).unwrap().frame_phase
            })
            .collect();
        assert_eq!(phases, vec![0, 1, 2, 3]);

        // Fifth lands on the earliest phase again
        let h = scheduler.admit(request).unwrap();
        assert_eq!(scheduler.reservation(h).unwrap().frame_phase, 0);
        assert_eq!(scheduler.frame_load(0), 200);
        assert_eq!(scheduler.frame_load(4), 200);
        assert_eq!(scheduler.frame_load(1), 100);
    }

    #[test]
    fn test_release_returns_capacity() {
        let scheduler = Scheduler::new(SchedulerSettings::uhci());
        let h = scheduler.admit(BandwidthRequest::new(1, 1, 900)).unwrap();
        assert!(scheduler.admit(BandwidthRequest::new(1, 1, 1)).is_err());

        scheduler.release(h).unwrap();
        assert_eq!(scheduler.stats().reserved, 0);
        assert!(scheduler.admit(BandwidthRequest::new(1, 1, 900)).is_ok());
    }

    #[test]
    fn test_release_twice_is_invalid_handle() {
        let scheduler = Scheduler::new(SchedulerSettings::uhci());
        let h = scheduler.admit(BandwidthRequest::new(2, 1, 50)).unwrap();
        scheduler.release(h).unwrap();

        let before = scheduler.stats();
        assert!(matches!(scheduler.release(h), Err(Error::InvalidHandle(x)) if x == h));
        assert_eq!(scheduler.stats(), before);
    }

    #[test]
    fn test_bad_shape_rejected() {
        let scheduler = Scheduler::new(SchedulerSettings::uhci());
        assert!(matches!(
            scheduler.admit(BandwidthRequest::new(3, 1, 10)),
            Err(Error::InvalidInterval { .. })
        ));
        assert!(matches!(
            scheduler.admit(BandwidthRequest::new(1, 2, 10)),
            Err(Error::InvalidInterval { .. })
        ));
        assert!(matches!(
            scheduler.admit(BandwidthRequest::new(2048, 1, 10)),
            Err(Error::InvalidInterval { .. })
        ));
    }
}
