// SPDX-License-Identifier: CEPL-1.0
//! Frame pacing across `F` frames in flight.
//!
//! The scheduler owns the ordering rules and nothing else; every driver call
//! goes through [`FrameOps`]. Per frame:
//!
//! 1) wait on the slot's fence
//! 2) acquire an image (out of date: rebuild, skip the frame)
//! 3) wait on whichever slot last rendered into that image
//! 4) reset the slot's fence, upload, submit, present
//! 5) advance the slot, rebuild if present asked for it
//!
//! The fence is reset only after a successful acquire so a skipped frame
//! leaves it signalled.

use anyhow::{anyhow, Context, Result};
use ash::vk::{self, Handle};
use tilemerge_render::{FrameOutcome, TileGrid};
use tracing::{info, trace};

use crate::error::GfxError;
use crate::teardown::TeardownRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Present {
    Presented,
    NeedsRebuild,
}

pub fn classify_acquire(r: Result<(u32, bool), vk::Result>) -> Result<Acquire, GfxError> {
    match r {
        Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
        Err(code) => Err(GfxError::unexpected("acquire_next_image", code)),
    }
}

pub fn classify_present(r: Result<bool, vk::Result>) -> Result<Present, GfxError> {
    match r {
        Ok(false) => Ok(Present::Presented),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Present::NeedsRebuild),
        Err(code) => Err(GfxError::unexpected("queue_present", code)),
    }
}

/// Synchronization objects for one frame in flight.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    /// The fence starts signalled so the first wait on it returns at once.
    pub(crate) unsafe fn create(&mut self, device: &ash::Device) -> Result<()> {
        let sci = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        let fci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        unsafe {
            self.image_available = device
                .create_semaphore(&sci, None)
                .context("create_semaphore(image_available)")?;
            self.render_finished = device
                .create_semaphore(&sci, None)
                .context("create_semaphore(render_finished)")?;
            self.in_flight = device.create_fence(&fci, None).context("create_fence")?;
        }
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        !self.in_flight.is_null()
    }
}

pub fn hand_over_slots(slots: &mut Vec<FrameSlot>, record: &mut TeardownRecord) {
    for s in slots.drain(..) {
        record.semaphores.extend([s.image_available, s.render_finished]);
        record.fences.push(s.in_flight);
    }
}

/// Driver-facing half of a frame. `slot` is in `0..F`, `image` in `0..N`.
pub trait FrameOps {
    fn wait_fence(&mut self, slot: usize) -> Result<()>;
    fn reset_fence(&mut self, slot: usize) -> Result<()>;
    fn acquire(&mut self, slot: usize) -> Result<Acquire>;
    fn upload_geometry(&mut self, slot: usize, image: u32, grid: &dyn TileGrid) -> Result<()>;
    fn submit(&mut self, slot: usize, image: u32) -> Result<()>;
    fn present(&mut self, slot: usize, image: u32) -> Result<Present>;
    /// Tears down and recreates the swapchain set. Returns the new image
    /// count, or `None` when the surface has no area and the rebuild has to
    /// wait.
    fn rebuild(&mut self) -> Result<Option<usize>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Rendering,
    Submitted,
    Presenting,
}

#[derive(Debug)]
pub struct FrameScheduler {
    frames_in_flight: usize,
    slot: usize,
    /// Which slot's fence guards each swapchain image, if any.
    image_fences: Vec<Option<usize>>,
    state: FrameState,
    rebuild_pending: bool,
    #[cfg(test)]
    history: Vec<FrameState>,
}

impl FrameScheduler {
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            slot: 0,
            image_fences: vec![None; image_count],
            state: FrameState::Idle,
            rebuild_pending: false,
            #[cfg(test)]
            history: Vec::new(),
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn current_slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn image_owner(&self, image: usize) -> Option<usize> {
        self.image_fences.get(image).copied().flatten()
    }

    /// Length of the image fence table, i.e. the image count it was last
    /// sized for.
    pub fn tracked_images(&self) -> usize {
        self.image_fences.len()
    }

    pub fn rebuild_pending(&self) -> bool {
        self.rebuild_pending
    }

    /// The next frame rebuilds before acquiring.
    pub fn request_rebuild(&mut self) {
        self.rebuild_pending = true;
    }

    fn enter(&mut self, state: FrameState) {
        self.state = state;
        #[cfg(test)]
        self.history.push(state);
    }

    /// `true` when a swapchain exists afterwards.
    fn rebuild(&mut self, ops: &mut dyn FrameOps, trigger: &'static str) -> Result<bool> {
        self.enter(FrameState::Idle);
        info!(trigger, "swapchain rebuild");
        match ops.rebuild()? {
            Some(n) => {
                self.image_fences = vec![None; n];
                self.rebuild_pending = false;
                trace!(images = n, "image fence table reset");
                Ok(true)
            }
            None => {
                self.rebuild_pending = true;
                trace!("rebuild deferred");
                Ok(false)
            }
        }
    }

    pub fn run_frame(&mut self, ops: &mut dyn FrameOps, grid: &dyn TileGrid) -> Result<FrameOutcome> {
        if self.rebuild_pending && !self.rebuild(ops, "requested")? {
            return Ok(FrameOutcome::Paused);
        }
        let slot = self.slot;

        self.enter(FrameState::Acquiring);
        ops.wait_fence(slot)?;
        let (image, suboptimal) = match ops.acquire(slot)? {
            Acquire::Image { index, suboptimal } => (index, suboptimal),
            Acquire::OutOfDate => {
                return Ok(if self.rebuild(ops, "acquire out of date")? {
                    FrameOutcome::SkippedForRebuild
                } else {
                    FrameOutcome::Paused
                });
            }
        };

        let entry = self
            .image_fences
            .get_mut(image as usize)
            .ok_or_else(|| anyhow!("acquired image {image} outside the fence table"))?;
        if let Some(owner) = *entry {
            if owner != slot {
                ops.wait_fence(owner)?;
            }
        }
        *entry = Some(slot);
        ops.reset_fence(slot)?;

        self.enter(FrameState::Rendering);
        ops.upload_geometry(slot, image, grid)?;
        ops.submit(slot, image)?;
        self.enter(FrameState::Submitted);

        self.enter(FrameState::Presenting);
        let presented = ops.present(slot, image)?;
        self.slot = (slot + 1) % self.frames_in_flight;
        self.enter(FrameState::Idle);
        trace!(slot, image, ?presented, suboptimal, "frame presented");

        // Suboptimal at acquire is tolerated; only present asks for a rebuild.
        if presented == Present::NeedsRebuild {
            self.rebuild(ops, "present out of date or suboptimal")?;
            return Ok(FrameOutcome::PresentedThenRebuilt);
        }
        Ok(FrameOutcome::Presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Ev {
        Wait(usize),
        Reset(usize),
        Acquire(usize),
        Upload(usize, u32),
        Submit(usize, u32),
        Present(usize, u32),
        Rebuild,
    }

    struct Fake {
        log: Vec<Ev>,
        images: u32,
        next_image: u32,
        acquires: VecDeque<Acquire>,
        presents: VecDeque<Present>,
        rebuilds: VecDeque<Option<usize>>,
    }

    impl Fake {
        fn new(images: u32) -> Self {
            Self {
                log: Vec::new(),
                images,
                next_image: 0,
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                rebuilds: VecDeque::new(),
            }
        }
    }

    impl FrameOps for Fake {
        fn wait_fence(&mut self, slot: usize) -> Result<()> {
            self.log.push(Ev::Wait(slot));
            Ok(())
        }
        fn reset_fence(&mut self, slot: usize) -> Result<()> {
            self.log.push(Ev::Reset(slot));
            Ok(())
        }
        fn acquire(&mut self, slot: usize) -> Result<Acquire> {
            self.log.push(Ev::Acquire(slot));
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % self.images;
                Acquire::Image {
                    index,
                    suboptimal: false,
                }
            }))
        }
        fn upload_geometry(&mut self, slot: usize, image: u32, _: &dyn TileGrid) -> Result<()> {
            self.log.push(Ev::Upload(slot, image));
            Ok(())
        }
        fn submit(&mut self, slot: usize, image: u32) -> Result<()> {
            self.log.push(Ev::Submit(slot, image));
            Ok(())
        }
        fn present(&mut self, slot: usize, image: u32) -> Result<Present> {
            self.log.push(Ev::Present(slot, image));
            Ok(self.presents.pop_front().unwrap_or(Present::Presented))
        }
        fn rebuild(&mut self) -> Result<Option<usize>> {
            self.log.push(Ev::Rebuild);
            Ok(self
                .rebuilds
                .pop_front()
                .unwrap_or(Some(self.images as usize)))
        }
    }

    struct Empty;

    impl TileGrid for Empty {
        fn dims(&self) -> (u32, u32) {
            (4, 4)
        }
        fn value(&self, _: u32, _: u32) -> u32 {
            0
        }
    }

    #[test]
    fn first_frame_runs_in_order() {
        let mut ops = Fake::new(3);
        let mut s = FrameScheduler::new(2, 3);
        assert_eq!(s.run_frame(&mut ops, &Empty).unwrap(), FrameOutcome::Presented);
        assert_eq!(
            ops.log,
            vec![
                Ev::Wait(0),
                Ev::Acquire(0),
                Ev::Reset(0),
                Ev::Upload(0, 0),
                Ev::Submit(0, 0),
                Ev::Present(0, 0),
            ]
        );
        assert_eq!(s.current_slot(), 1);
        assert_eq!(s.state(), FrameState::Idle);
        assert_eq!(s.image_owner(0), Some(0));
    }

    #[test]
    fn slots_cycle_through_frames_in_flight() {
        let mut ops = Fake::new(3);
        let mut s = FrameScheduler::new(2, 3);
        for _ in 0..3 {
            s.run_frame(&mut ops, &Empty).unwrap();
        }
        let waits: Vec<_> = ops
            .log
            .iter()
            .filter(|e| matches!(e, Ev::Wait(_)))
            .cloned()
            .collect();
        assert_eq!(waits, vec![Ev::Wait(0), Ev::Wait(1), Ev::Wait(0)]);
        assert_eq!(s.current_slot(), 1);
    }

    #[test]
    fn image_held_by_another_slot_waits_on_that_slot() {
        let mut ops = Fake::new(2);
        let mut s = FrameScheduler::new(3, 2);
        // Slot 0 takes image 0, slot 1 image 1, slot 2 image 0 again.
        for _ in 0..3 {
            s.run_frame(&mut ops, &Empty).unwrap();
        }
        let tail = &ops.log[ops.log.len() - 7..];
        assert_eq!(
            tail,
            &[
                Ev::Wait(2),
                Ev::Acquire(2),
                Ev::Wait(0),
                Ev::Reset(2),
                Ev::Upload(2, 0),
                Ev::Submit(2, 0),
                Ev::Present(2, 0),
            ]
        );
        assert_eq!(s.image_owner(0), Some(2));
    }

    #[test]
    fn out_of_date_acquire_skips_the_frame_and_keeps_the_slot() {
        let mut ops = Fake::new(3);
        ops.acquires.push_back(Acquire::OutOfDate);
        let mut s = FrameScheduler::new(2, 3);
        assert_eq!(
            s.run_frame(&mut ops, &Empty).unwrap(),
            FrameOutcome::SkippedForRebuild
        );
        assert_eq!(ops.log, vec![Ev::Wait(0), Ev::Acquire(0), Ev::Rebuild]);
        assert_eq!(s.current_slot(), 0);
        assert!(!s.rebuild_pending());
    }

    #[test]
    fn suboptimal_present_rebuilds_after_presenting() {
        let mut s2 = FrameScheduler::new(2, 3);
        let mut ops2 = Fake::new(3);
        ops2.presents.push_back(Present::NeedsRebuild);
        assert_eq!(
            s2.run_frame(&mut ops2, &Empty).unwrap(),
            FrameOutcome::PresentedThenRebuilt
        );
        assert_eq!(ops2.log.last(), Some(&Ev::Rebuild));
        assert_eq!(ops2.log[ops2.log.len() - 2], Ev::Present(0, 0));
        assert_eq!(s2.current_slot(), 1);
        assert_eq!(s2.image_owner(0), None);
    }

    #[test]
    fn suboptimal_acquire_still_presents() {
        let mut ops = Fake::new(3);
        ops.acquires.push_back(Acquire::Image {
            index: 1,
            suboptimal: true,
        });
        let mut s = FrameScheduler::new(2, 3);
        assert_eq!(s.run_frame(&mut ops, &Empty).unwrap(), FrameOutcome::Presented);
        assert!(ops.log.contains(&Ev::Present(0, 1)));
        assert!(!ops.log.contains(&Ev::Rebuild));
        assert!(!s.rebuild_pending());
        assert_eq!(s.image_owner(1), Some(0));
    }

    #[test]
    fn frame_walks_every_state_once() {
        let mut ops = Fake::new(3);
        let mut s = FrameScheduler::new(2, 3);
        s.run_frame(&mut ops, &Empty).unwrap();
        assert_eq!(
            s.history,
            vec![
                FrameState::Acquiring,
                FrameState::Rendering,
                FrameState::Submitted,
                FrameState::Presenting,
                FrameState::Idle,
            ]
        );
    }

    #[test]
    fn failed_present_stops_after_submission() {
        struct FailingPresent(Fake);
        impl FrameOps for FailingPresent {
            fn wait_fence(&mut self, slot: usize) -> Result<()> {
                self.0.wait_fence(slot)
            }
            fn reset_fence(&mut self, slot: usize) -> Result<()> {
                self.0.reset_fence(slot)
            }
            fn acquire(&mut self, slot: usize) -> Result<Acquire> {
                self.0.acquire(slot)
            }
            fn upload_geometry(&mut self, slot: usize, image: u32, g: &dyn TileGrid) -> Result<()> {
                self.0.upload_geometry(slot, image, g)
            }
            fn submit(&mut self, slot: usize, image: u32) -> Result<()> {
                self.0.submit(slot, image)
            }
            fn present(&mut self, _: usize, _: u32) -> Result<Present> {
                Err(anyhow!("device lost"))
            }
            fn rebuild(&mut self) -> Result<Option<usize>> {
                self.0.rebuild()
            }
        }

        let mut ops = FailingPresent(Fake::new(3));
        let mut s = FrameScheduler::new(2, 3);
        assert!(s.run_frame(&mut ops, &Empty).is_err());
        assert_eq!(s.state(), FrameState::Presenting);
        assert!(s.history.contains(&FrameState::Submitted));
        assert_eq!(s.current_slot(), 0);
    }

    #[test]
    fn requested_rebuild_happens_before_acquire() {
        let mut ops = Fake::new(4);
        let mut s = FrameScheduler::new(2, 3);
        s.request_rebuild();
        s.run_frame(&mut ops, &Empty).unwrap();
        assert_eq!(ops.log[0], Ev::Rebuild);
        assert_eq!(ops.log[1], Ev::Wait(0));
        assert_eq!(s.tracked_images(), 4);
        assert_eq!(s.image_owner(0), Some(0));
        assert!(!s.rebuild_pending());
    }

    #[test]
    fn zero_area_rebuild_pauses_until_it_succeeds() {
        let mut ops = Fake::new(3);
        ops.rebuilds.push_back(None);
        let mut s = FrameScheduler::new(2, 3);
        s.request_rebuild();
        assert_eq!(s.run_frame(&mut ops, &Empty).unwrap(), FrameOutcome::Paused);
        assert_eq!(ops.log, vec![Ev::Rebuild]);
        assert!(s.rebuild_pending());

        assert_eq!(s.run_frame(&mut ops, &Empty).unwrap(), FrameOutcome::Presented);
        assert!(!s.rebuild_pending());
    }

    #[test]
    fn acquire_outside_the_table_is_an_error() {
        let mut ops = Fake::new(3);
        ops.acquires.push_back(Acquire::Image {
            index: 7,
            suboptimal: false,
        });
        let mut s = FrameScheduler::new(2, 3);
        assert!(s.run_frame(&mut ops, &Empty).is_err());
    }

    #[test]
    fn classification_of_driver_results() {
        assert_eq!(
            classify_acquire(Ok((2, false))).unwrap(),
            Acquire::Image {
                index: 2,
                suboptimal: false
            }
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            Acquire::OutOfDate
        );
        assert!(matches!(
            classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(GfxError::UnexpectedResult { .. })
        ));
        assert_eq!(classify_present(Ok(false)).unwrap(), Present::Presented);
        assert_eq!(classify_present(Ok(true)).unwrap(), Present::NeedsRebuild);
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            Present::NeedsRebuild
        );
        assert!(classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).is_err());
    }

    #[test]
    fn slots_hand_over_all_sync_objects() {
        let mut slots = vec![
            FrameSlot {
                image_available: vk::Semaphore::from_raw(1),
                render_finished: vk::Semaphore::from_raw(2),
                in_flight: vk::Fence::from_raw(3),
            };
            2
        ];
        let mut record = TeardownRecord::default();
        hand_over_slots(&mut slots, &mut record);
        assert!(slots.is_empty());
        assert_eq!(record.semaphores.len(), 4);
        assert_eq!(record.fences.len(), 2);
    }
}
