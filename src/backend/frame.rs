// Frame scheduling - the per-frame synchronization protocol
//
// A fixed ring of MAX_FRAMES_IN_FLIGHT slots, each with its own semaphores and
// fence. Every draw_frame call runs:
//
//   wait slot fence -> acquire image -> wait image's previous slot ->
//   reset fence + submit -> present -> advance
//
// The GPU is reached through `FrameBackend`, so the protocol itself does not
// care whether it talks to a real queue or a test double.

use anyhow::{bail, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use super::swapchain::{Swapchain, SwapchainManager};
use super::sync::FrameSync;
use super::VulkanDevice;
use crate::error::{vk_check, EngineError};
use crate::surface::ResizeFlag;

/// Number of frames the CPU may run ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Shared by every blocking wait in the protocol. Effectively "forever"; a
/// wait that still times out means the device is gone.
pub const FENCE_TIMEOUT: u64 = u64::MAX;

/// One queue submission as the scheduler builds it
#[derive(Debug, Clone, Copy)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

/// GPU operations the frame protocol needs. Raw `VkResult`s come back so the
/// scheduler decides which codes are stale-swapchain and which are fatal.
pub trait FrameBackend {
    fn wait_for_fence(&mut self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()>;
    /// Returns `(image_index, suboptimal)`
    fn acquire_next_image(&mut self, signal: vk::Semaphore, timeout: u64) -> VkResult<(u32, bool)>;
    fn submit(&mut self, submission: &Submission) -> VkResult<()>;
    /// Returns whether the swapchain was suboptimal
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool>;
    fn recreate_swapchain(&mut self) -> Result<()>;
}

/// Supplies fully recorded command buffers, one per swapchain image
pub trait CommandBufferProvider {
    fn command_buffer(&mut self, image_index: u32) -> vk::CommandBuffer;

    /// A new swapchain generation exists; re-record against its framebuffers
    fn swapchain_rebuilt(&mut self, swapchain: &Swapchain) -> Result<()>;
}

/// Refreshes per-image GPU-visible data before an image is reused
pub trait FrameDataUpdater {
    fn update(&mut self, image_index: u32) -> Result<()>;
}

impl FrameDataUpdater for () {
    fn update(&mut self, _image_index: u32) -> Result<()> {
        Ok(())
    }
}

/// Real backend: the device's queues plus the swapchain manager
pub struct VulkanFrameBackend<'a> {
    pub device: &'a VulkanDevice,
    pub swapchain: &'a mut SwapchainManager,
}

impl FrameBackend for VulkanFrameBackend<'_> {
    fn wait_for_fence(&mut self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.device.device.wait_for_fences(&[fence], true, timeout) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.device.reset_fences(&[fence]) }
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore, timeout: u64) -> VkResult<(u32, bool)> {
        self.swapchain.acquire_next_image(signal, timeout)
    }

    fn submit(&mut self, submission: &Submission) -> VkResult<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        let command_buffers = [submission.command_buffer];
        let signal_semaphores = [submission.signal_semaphore];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], submission.fence)
        }
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        self.swapchain.present(self.device.present_queue, image_index, wait)
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        self.swapchain.recreate()
    }
}

/// Where a frame slot is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Fence observed signaled, nothing of this slot is on the GPU
    Idle,
    Acquiring,
    Submitted { image_index: u32 },
    /// Handed to the presentation engine; GPU work may still be running
    Presented { image_index: u32 },
}

impl SlotState {
    pub fn can_transition_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Idle, Idle)
                | (Presented { .. }, Idle)
                | (Idle, Acquiring)
                | (Acquiring, Idle)
                | (Acquiring, Submitted { .. })
                | (Submitted { .. }, Presented { .. })
        )
    }
}

#[derive(Debug)]
struct FrameSlot {
    sync: FrameSync,
    state: SlotState,
}

/// What happened to a draw_frame call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Image presented; the swapchain may have been rebuilt afterwards
    Presented { swapchain_rebuilt: bool },
    /// Acquire found the swapchain out of date. It was rebuilt and nothing
    /// was submitted.
    Skipped,
    /// No swapchain exists (zero-area window); nothing touched the GPU
    Suspended,
}

impl FrameStatus {
    pub fn swapchain_rebuilt(&self) -> bool {
        matches!(
            self,
            FrameStatus::Skipped | FrameStatus::Presented { swapchain_rebuilt: true }
        )
    }
}

/// Drives frames through the slot ring. Must only be used from the render
/// thread; every mutating call takes `&mut self`.
pub struct FrameScheduler {
    slots: Vec<FrameSlot>,
    current_frame: usize,
    /// swapchain image index -> slot that last submitted work for it
    images_in_flight: HashMap<u32, usize>,
    // Owner of the sync objects; None for externally managed handles
    device: Option<Arc<VulkanDevice>>,
}

impl FrameScheduler {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let mut slots = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for i in 0..MAX_FRAMES_IN_FLIGHT {
            match FrameSync::new(&device) {
                Ok(sync) => {
                    log::debug!("Created sync objects for frame slot {}", i);
                    slots.push(FrameSlot { sync, state: SlotState::Idle });
                }
                Err(e) => {
                    for slot in &slots {
                        slot.sync.destroy(&device.device);
                    }
                    return Err(e);
                }
            }
        }

        log::info!("Frame scheduler created with {} frames in flight", MAX_FRAMES_IN_FLIGHT);

        Ok(Self {
            slots,
            current_frame: 0,
            images_in_flight: HashMap::new(),
            device: Some(device),
        })
    }

    /// Slot the next draw_frame will use
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot].state
    }

    pub fn slot_sync(&self, slot: usize) -> &FrameSync {
        &self.slots[slot].sync
    }

    /// Slot that last submitted work targeting `image_index`
    pub fn image_owner(&self, image_index: u32) -> Option<usize> {
        self.images_in_flight.get(&image_index).copied()
    }

    /// Run one frame through the protocol.
    ///
    /// Out-of-date and suboptimal results, as well as a pending resize, lead
    /// to a swapchain rebuild and are never returned as errors. Everything
    /// else that goes wrong on the GPU side is fatal.
    pub fn draw_frame<B, C, U>(
        &mut self,
        backend: &mut B,
        commands: &mut C,
        updater: &mut U,
        resize: &ResizeFlag,
    ) -> Result<FrameStatus>
    where
        B: FrameBackend + ?Sized,
        C: CommandBufferProvider + ?Sized,
        U: FrameDataUpdater + ?Sized,
    {
        let slot = self.current_frame;
        let sync = self.slots[slot].sync;

        // Wait until the GPU is done with this slot's previous submission
        self.wait_for_slot(backend, slot)?;
        self.transition(slot, SlotState::Idle)?;
        self.transition(slot, SlotState::Acquiring)?;

        // Acquire. The fence has not been reset yet, so abandoning the frame
        // here leaves the slot reusable.
        let (image_index, acquire_suboptimal) =
            match backend.acquire_next_image(sync.image_available, FENCE_TIMEOUT) {
                Ok(acquired) => acquired,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    log::debug!("Swapchain out of date on acquire, rebuilding");
                    self.transition(slot, SlotState::Idle)?;
                    backend.recreate_swapchain()?;
                    return Ok(FrameStatus::Skipped);
                }
                Err(e) => {
                    self.transition(slot, SlotState::Idle)?;
                    return Err(EngineError::vulkan("vkAcquireNextImageKHR", e).into());
                }
            };

        // Another slot may still be rendering into this image
        if let Some(owner) = self.image_owner(image_index) {
            if owner != slot {
                self.wait_for_slot(backend, owner)?;
            }
            updater.update(image_index)?;
        }
        self.images_in_flight.insert(image_index, slot);

        // Submit
        vk_check("vkResetFences", backend.reset_fence(sync.in_flight_fence))?;

        let submission = Submission {
            command_buffer: commands.command_buffer(image_index),
            wait_semaphore: sync.image_available,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: sync.render_finished,
            fence: sync.in_flight_fence,
        };

        if let Err(e) = backend.submit(&submission) {
            if let Err(reset_err) = backend.reset_fence(sync.in_flight_fence) {
                log::warn!("Failed to reset fence of frame slot {}: {:?}", slot, reset_err);
            }
            self.transition(slot, SlotState::Idle)?;
            log::error!("Failed to submit draw command buffer: {:?}", e);
            return Err(EngineError::vulkan("vkQueueSubmit", e).into());
        }
        self.transition(slot, SlotState::Submitted { image_index })?;

        // Present
        let present = backend.present(image_index, sync.render_finished);
        self.transition(slot, SlotState::Presented { image_index })?;

        let present_stale = match present {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(EngineError::vulkan("vkQueuePresentKHR", e).into()),
        };

        // Always consume the flag so a resize is never handled twice
        let resized = resize.take();
        let swapchain_rebuilt = present_stale || acquire_suboptimal || resized;
        if swapchain_rebuilt {
            log::debug!(
                "Rebuilding swapchain after present (stale: {}, suboptimal acquire: {}, resized: {})",
                present_stale,
                acquire_suboptimal,
                resized
            );
            backend.recreate_swapchain()?;
        }

        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;

        Ok(FrameStatus::Presented { swapchain_rebuilt })
    }

    fn wait_for_slot<B: FrameBackend + ?Sized>(&self, backend: &mut B, slot: usize) -> Result<()> {
        match backend.wait_for_fence(self.slots[slot].sync.in_flight_fence, FENCE_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(EngineError::FenceTimeout { slot }.into()),
            Err(e) => Err(EngineError::vulkan("vkWaitForFences", e).into()),
        }
    }

    fn transition(&mut self, slot: usize, next: SlotState) -> Result<()> {
        let state = &mut self.slots[slot].state;
        if !state.can_transition_to(next) {
            bail!("Frame slot {}: illegal transition {:?} -> {:?}", slot, state, next);
        }
        *state = next;
        Ok(())
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            // Fences and semaphores may still be referenced by queued work
            if let Err(e) = device.wait_idle() {
                log::error!("Device not idle while destroying frame slots: {:#}", e);
            }
            for slot in &self.slots {
                slot.sync.destroy(&device.device);
            }
        }
    }
}

#[cfg(test)]
impl FrameScheduler {
    fn with_sync_objects(syncs: [FrameSync; MAX_FRAMES_IN_FLIGHT]) -> Self {
        Self {
            slots: syncs
                .into_iter()
                .map(|sync| FrameSlot { sync, state: SlotState::Idle })
                .collect(),
            current_frame: 0,
            images_in_flight: HashMap::new(),
            device: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FenceState {
        Signaled,
        /// Reset with no work queued; waiting on it would hang
        Unsignaled,
        /// Work queued that will signal it
        Pending,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(vk::Fence),
        Reset(vk::Fence),
        Acquire(vk::Semaphore),
        Submit(vk::CommandBuffer, vk::Fence),
        Present(u32, vk::Semaphore),
        Recreate,
    }

    /// GPU double: work "completes" when the CPU waits on its fence
    struct MockGpu {
        fences: HashMap<vk::Fence, FenceState>,
        image_count: u32,
        next_image: u32,
        acquire_script: VecDeque<VkResult<(u32, bool)>>,
        present_script: VecDeque<VkResult<bool>>,
        submit_error: Option<vk::Result>,
        /// Fails every reset issued after a submit was attempted
        reset_error_after_submit: Option<vk::Result>,
        wait_error: Option<vk::Result>,
        acquired: Option<u32>,
        /// image -> fence of the last submission that wrote it
        image_writer: HashMap<u32, vk::Fence>,
        calls: Vec<Call>,
        violations: usize,
        /// Resets of a fence whose work was never waited on
        premature_resets: usize,
        max_pending: usize,
    }

    impl MockGpu {
        fn new(scheduler: &FrameScheduler, image_count: u32) -> Self {
            let fences = (0..MAX_FRAMES_IN_FLIGHT)
                .map(|slot| (scheduler.slot_sync(slot).in_flight_fence, FenceState::Signaled))
                .collect();
            Self {
                fences,
                image_count,
                next_image: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                submit_error: None,
                reset_error_after_submit: None,
                wait_error: None,
                acquired: None,
                image_writer: HashMap::new(),
                calls: Vec::new(),
                violations: 0,
                premature_resets: 0,
                max_pending: 0,
            }
        }

        fn pending(&self) -> usize {
            self.fences.values().filter(|&&s| s != FenceState::Signaled).count()
        }

        fn submits(&self) -> usize {
            self.calls.iter().filter(|c| matches!(c, Call::Submit(..))).count()
        }

        fn presents(&self) -> usize {
            self.calls.iter().filter(|c| matches!(c, Call::Present(..))).count()
        }

        fn recreates(&self) -> usize {
            self.calls.iter().filter(|c| matches!(c, Call::Recreate)).count()
        }
    }

    impl FrameBackend for MockGpu {
        fn wait_for_fence(&mut self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
            self.calls.push(Call::Wait(fence));
            if let Some(e) = self.wait_error {
                return Err(e);
            }
            let state = self.fences.get_mut(&fence).expect("unknown fence");
            match *state {
                FenceState::Unsignaled => Err(vk::Result::TIMEOUT),
                _ => {
                    *state = FenceState::Signaled;
                    Ok(())
                }
            }
        }

        fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
            self.calls.push(Call::Reset(fence));
            if let Some(e) = self.reset_error_after_submit {
                if self.submits() > 0 {
                    return Err(e);
                }
            }
            if self.fences[&fence] == FenceState::Pending {
                self.premature_resets += 1;
            }
            self.fences.insert(fence, FenceState::Unsignaled);
            Ok(())
        }

        fn acquire_next_image(&mut self, signal: vk::Semaphore, _timeout: u64) -> VkResult<(u32, bool)> {
            self.calls.push(Call::Acquire(signal));
            let result = self.acquire_script.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                Ok((index, false))
            });
            self.acquired = result.ok().map(|(index, _)| index);
            result
        }

        fn submit(&mut self, submission: &Submission) -> VkResult<()> {
            self.calls.push(Call::Submit(submission.command_buffer, submission.fence));
            if let Some(e) = self.submit_error {
                return Err(e);
            }

            assert_eq!(self.fences[&submission.fence], FenceState::Unsignaled);
            assert_eq!(submission.wait_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);

            let image = self.acquired.expect("submit without acquire");
            if let Some(previous) = self.image_writer.get(&image) {
                if *previous != submission.fence && self.fences[previous] == FenceState::Pending {
                    self.violations += 1;
                }
            }
            self.image_writer.insert(image, submission.fence);
            self.fences.insert(submission.fence, FenceState::Pending);
            self.max_pending = self.max_pending.max(self.pending());
            Ok(())
        }

        fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
            self.calls.push(Call::Present(image_index, wait));
            self.present_script.pop_front().unwrap_or(Ok(false))
        }

        fn recreate_swapchain(&mut self) -> Result<()> {
            self.calls.push(Call::Recreate);
            Ok(())
        }
    }

    /// Command buffer handle = 1000 + image index
    #[derive(Default)]
    struct FakeCommands {
        requested: Vec<u32>,
    }

    impl CommandBufferProvider for FakeCommands {
        fn command_buffer(&mut self, image_index: u32) -> vk::CommandBuffer {
            self.requested.push(image_index);
            vk::CommandBuffer::from_raw(1000 + image_index as u64)
        }

        fn swapchain_rebuilt(&mut self, _swapchain: &Swapchain) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingUpdater {
        updated: Vec<u32>,
    }

    impl FrameDataUpdater for RecordingUpdater {
        fn update(&mut self, image_index: u32) -> Result<()> {
            self.updated.push(image_index);
            Ok(())
        }
    }

    fn sync(base: u64) -> FrameSync {
        FrameSync {
            image_available: vk::Semaphore::from_raw(base + 1),
            render_finished: vk::Semaphore::from_raw(base + 2),
            in_flight_fence: vk::Fence::from_raw(base + 3),
        }
    }

    fn scheduler() -> FrameScheduler {
        FrameScheduler::with_sync_objects([sync(10), sync(20)])
    }

    #[test]
    fn presented_frame_follows_protocol_order() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        let slot0 = *scheduler.slot_sync(0);

        let status = scheduler
            .draw_frame(&mut gpu, &mut FakeCommands::default(), &mut (), &ResizeFlag::new())
            .unwrap();

        assert_eq!(status, FrameStatus::Presented { swapchain_rebuilt: false });
        assert_eq!(
            gpu.calls,
            vec![
                Call::Wait(slot0.in_flight_fence),
                Call::Acquire(slot0.image_available),
                Call::Reset(slot0.in_flight_fence),
                Call::Submit(vk::CommandBuffer::from_raw(1000), slot0.in_flight_fence),
                Call::Present(0, slot0.render_finished),
            ]
        );
        assert_eq!(scheduler.current_frame(), 1);
        assert_eq!(scheduler.slot_state(0), SlotState::Presented { image_index: 0 });
        assert_eq!(scheduler.image_owner(0), Some(0));
    }

    #[test]
    fn slots_rotate_round_robin() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        let mut commands = FakeCommands::default();
        let resize = ResizeFlag::new();

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(scheduler.current_frame());
            scheduler.draw_frame(&mut gpu, &mut commands, &mut (), &resize).unwrap();
        }

        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
        assert_eq!(commands.requested, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn out_of_date_acquire_skips_the_frame() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        gpu.acquire_script.push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        let mut commands = FakeCommands::default();
        let resize = ResizeFlag::new();

        let status = scheduler.draw_frame(&mut gpu, &mut commands, &mut (), &resize).unwrap();

        assert_eq!(status, FrameStatus::Skipped);
        assert!(status.swapchain_rebuilt());
        assert_eq!(gpu.recreates(), 1);
        assert_eq!(gpu.submits(), 0);
        assert_eq!(gpu.presents(), 0);
        assert!(commands.requested.is_empty());
        assert_eq!(scheduler.current_frame(), 0);
        assert_eq!(scheduler.slot_state(0), SlotState::Idle);

        // The fence was never reset, so the same slot is usable right away
        let status = scheduler.draw_frame(&mut gpu, &mut commands, &mut (), &resize).unwrap();
        assert_eq!(status, FrameStatus::Presented { swapchain_rebuilt: false });
        assert_eq!(scheduler.current_frame(), 1);
    }

    #[test]
    fn image_owned_by_other_slot_is_waited_on() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        gpu.acquire_script.push_back(Ok((0, false)));
        gpu.acquire_script.push_back(Ok((0, false)));
        let mut commands = FakeCommands::default();
        let mut updater = RecordingUpdater::default();
        let resize = ResizeFlag::new();
        let fence0 = scheduler.slot_sync(0).in_flight_fence;
        let fence1 = scheduler.slot_sync(1).in_flight_fence;

        scheduler.draw_frame(&mut gpu, &mut commands, &mut updater, &resize).unwrap();
        assert!(updater.updated.is_empty());

        gpu.calls.clear();
        scheduler.draw_frame(&mut gpu, &mut commands, &mut updater, &resize).unwrap();

        assert_eq!(gpu.calls[0], Call::Wait(fence1));
        assert_eq!(gpu.calls[2], Call::Wait(fence0));
        assert_eq!(updater.updated, vec![0]);
        assert_eq!(scheduler.image_owner(0), Some(1));
        assert_eq!(gpu.violations, 0);
    }

    #[test]
    fn image_reused_by_same_slot_is_not_waited_twice() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        // slot 0 -> image 1, slot 1 -> image 2, slot 0 -> image 1 again
        for index in [1, 2, 1] {
            gpu.acquire_script.push_back(Ok((index, false)));
        }
        let mut commands = FakeCommands::default();
        let mut updater = RecordingUpdater::default();
        let resize = ResizeFlag::new();
        let fence0 = scheduler.slot_sync(0).in_flight_fence;

        scheduler.draw_frame(&mut gpu, &mut commands, &mut updater, &resize).unwrap();
        scheduler.draw_frame(&mut gpu, &mut commands, &mut updater, &resize).unwrap();
        gpu.calls.clear();
        scheduler.draw_frame(&mut gpu, &mut commands, &mut updater, &resize).unwrap();

        let waits = gpu.calls.iter().filter(|c| **c == Call::Wait(fence0)).count();
        assert_eq!(waits, 1);
        assert_eq!(updater.updated, vec![1]);
    }

    #[test]
    fn in_flight_bounds_hold_over_long_runs() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        let pattern = [0, 1, 1, 2, 0, 0, 2, 1, 0, 2, 2, 1, 0, 1, 2, 0];
        for _ in 0..4 {
            for &index in &pattern {
                gpu.acquire_script.push_back(Ok((index, false)));
            }
        }
        let mut commands = FakeCommands::default();
        let resize = ResizeFlag::new();

        for _ in 0..pattern.len() * 4 {
            scheduler.draw_frame(&mut gpu, &mut commands, &mut (), &resize).unwrap();
            assert_eq!(gpu.premature_resets, 0);
        }

        assert_eq!(gpu.violations, 0);
        // Both slots really overlapped at some point
        assert_eq!(gpu.max_pending, MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn stale_present_rebuilds_and_advances() {
        for result in [Ok(true), Err(vk::Result::ERROR_OUT_OF_DATE_KHR)] {
            let mut scheduler = scheduler();
            let mut gpu = MockGpu::new(&scheduler, 3);
            gpu.present_script.push_back(result);

            let status = scheduler
                .draw_frame(&mut gpu, &mut FakeCommands::default(), &mut (), &ResizeFlag::new())
                .unwrap();

            assert_eq!(status, FrameStatus::Presented { swapchain_rebuilt: true });
            assert_eq!(gpu.recreates(), 1);
            assert_eq!(scheduler.current_frame(), 1);
        }
    }

    #[test]
    fn resize_flag_is_consumed_on_present() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        let resize = ResizeFlag::new();
        resize.notify();

        let status = scheduler
            .draw_frame(&mut gpu, &mut FakeCommands::default(), &mut (), &resize)
            .unwrap();

        assert!(status.swapchain_rebuilt());
        assert!(!resize.is_set());
        assert_eq!(gpu.recreates(), 1);
        assert_eq!(*gpu.calls.last().unwrap(), Call::Recreate);

        let status = scheduler
            .draw_frame(&mut gpu, &mut FakeCommands::default(), &mut (), &resize)
            .unwrap();
        assert!(!status.swapchain_rebuilt());
        assert_eq!(gpu.recreates(), 1);
    }

    #[test]
    fn suboptimal_acquire_still_renders_then_rebuilds() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        gpu.acquire_script.push_back(Ok((2, true)));

        let status = scheduler
            .draw_frame(&mut gpu, &mut FakeCommands::default(), &mut (), &ResizeFlag::new())
            .unwrap();

        assert_eq!(status, FrameStatus::Presented { swapchain_rebuilt: true });
        assert_eq!(gpu.submits(), 1);
        assert_eq!(gpu.presents(), 1);
        assert_eq!(gpu.recreates(), 1);
    }

    #[test]
    fn submit_failure_is_fatal_and_resets_fence() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        gpu.submit_error = Some(vk::Result::ERROR_DEVICE_LOST);
        let fence0 = scheduler.slot_sync(0).in_flight_fence;

        let err = scheduler
            .draw_frame(&mut gpu, &mut FakeCommands::default(), &mut (), &ResizeFlag::new())
            .unwrap_err();

        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(engine_err.code(), Some(vk::Result::ERROR_DEVICE_LOST.as_raw()));
        assert_eq!(*gpu.calls.last().unwrap(), Call::Reset(fence0));
        assert_eq!(gpu.presents(), 0);
        assert_eq!(scheduler.current_frame(), 0);
    }

    #[test]
    fn failed_reset_after_failed_submit_keeps_submit_error() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        gpu.submit_error = Some(vk::Result::ERROR_DEVICE_LOST);
        gpu.reset_error_after_submit = Some(vk::Result::ERROR_OUT_OF_HOST_MEMORY);

        let err = scheduler
            .draw_frame(&mut gpu, &mut FakeCommands::default(), &mut (), &ResizeFlag::new())
            .unwrap_err();

        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(engine_err.code(), Some(vk::Result::ERROR_DEVICE_LOST.as_raw()));
        assert_eq!(scheduler.slot_state(0), SlotState::Idle);
    }

    #[test]
    fn skipping_the_slot_wait_is_detected() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        let fence0 = scheduler.slot_sync(0).in_flight_fence;
        let resize = ResizeFlag::new();

        scheduler.draw_frame(&mut gpu, &mut FakeCommands::default(), &mut (), &resize).unwrap();
        assert_eq!(gpu.premature_resets, 0);

        // Slot 0's work is still queued; resetting it without a wait counts
        gpu.reset_fence(fence0).unwrap();
        assert_eq!(gpu.premature_resets, 1);
    }

    #[test]
    fn fence_timeout_is_fatal() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        gpu.wait_error = Some(vk::Result::TIMEOUT);

        let err = scheduler
            .draw_frame(&mut gpu, &mut FakeCommands::default(), &mut (), &ResizeFlag::new())
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::FenceTimeout { slot: 0 })
        ));
        assert_eq!(gpu.calls.len(), 1);
    }

    #[test]
    fn acquire_device_loss_is_fatal() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        gpu.acquire_script.push_back(Err(vk::Result::ERROR_DEVICE_LOST));

        let err = scheduler
            .draw_frame(&mut gpu, &mut FakeCommands::default(), &mut (), &ResizeFlag::new())
            .unwrap_err();

        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(engine_err.code(), Some(-4));
        assert_eq!(gpu.recreates(), 0);
        assert_eq!(gpu.submits(), 0);
    }

    #[test]
    fn present_failure_is_fatal() {
        let mut scheduler = scheduler();
        let mut gpu = MockGpu::new(&scheduler, 3);
        gpu.present_script.push_back(Err(vk::Result::ERROR_SURFACE_LOST_KHR));

        let err = scheduler
            .draw_frame(&mut gpu, &mut FakeCommands::default(), &mut (), &ResizeFlag::new())
            .unwrap_err();

        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(engine_err.code(), Some(vk::Result::ERROR_SURFACE_LOST_KHR.as_raw()));
        assert_eq!(gpu.recreates(), 0);
    }

    #[test]
    fn slot_transitions_reject_reuse_while_submitted() {
        let submitted = SlotState::Submitted { image_index: 0 };
        assert!(!submitted.can_transition_to(SlotState::Acquiring));
        assert!(!submitted.can_transition_to(SlotState::Idle));
        assert!(!SlotState::Idle.can_transition_to(submitted));
        assert!(SlotState::Acquiring.can_transition_to(submitted));
        assert!(submitted.can_transition_to(SlotState::Presented { image_index: 0 }));
        assert!(SlotState::Presented { image_index: 0 }.can_transition_to(SlotState::Idle));
    }
}
