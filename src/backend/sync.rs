// Synchronization primitives
//
// The GPU timeline counter, per-slot frame pacing, and the binary
// semaphores wiring acquire, submit, and present together.
// Critical for correct multi-frame rendering: a frame slot's resources
// may only be reused once the timeline has passed the value recorded
// for that slot.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::RenderDevice;

/// Frame pacing policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pacing {
    /// Overlap up to buffer_count - 1 frames; wait only on the incoming
    /// slot's previously recorded timeline value.
    Pipelined,
    /// Drain the whole queue after every present. Simplest, lowest
    /// throughput.
    Lockstep,
}

/// Outcome of a bounded wait on the GPU timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Complete,
    TimedOut,
}

/// A monotonically increasing GPU completion counter.
///
/// `signal` enqueues a queue-side signal of the next value and returns
/// it; `wait` blocks the calling thread until the GPU has passed the
/// given value. The counter increases by exactly one per signal and
/// never repeats.
pub trait GpuTimeline {
    fn signal(&mut self) -> Result<u64>;
    fn completed_value(&self) -> Result<u64>;
    fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<WaitOutcome>;
}

/// Timeline semaphore owned by the graphics queue.
pub struct TimelineSemaphore {
    semaphore: vk::Semaphore,
    next_value: u64,
    queue: vk::Queue,
    device: Arc<RenderDevice>,
}

impl TimelineSemaphore {
    pub fn new(device: Arc<RenderDevice>) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }
            .context("Failed to create timeline semaphore")?;

        let queue = device.graphics_queue;
        Ok(Self {
            semaphore,
            next_value: 0,
            queue,
            device,
        })
    }

    /// The last value handed out by `signal`.
    #[inline]
    pub fn last_signaled(&self) -> u64 {
        self.next_value
    }
}

impl GpuTimeline for TimelineSemaphore {
    fn signal(&mut self) -> Result<u64> {
        self.next_value += 1;

        // Queue-side signal with no command buffers: the value becomes
        // visible once everything submitted before it has executed.
        let signal_values = [self.next_value];
        let signal_semaphores = [self.semaphore];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::builder()
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .device
                .queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())
        }
        .context("Failed to signal GPU timeline")?;

        Ok(self.next_value)
    }

    fn completed_value(&self) -> Result<u64> {
        unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) }
            .context("Failed to query GPU timeline")
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<WaitOutcome> {
        // Fast path: already past the target, no OS wait
        if self.completed_value()? >= value {
            return Ok(WaitOutcome::Complete);
        }

        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = timeout.map_or(u64::MAX, |d| {
            u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
        });

        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(WaitOutcome::Complete),
            // A timed-out wait is tolerated; the caller proceeds without
            // a completion guarantee.
            Err(vk::Result::TIMEOUT) => {
                log::warn!("Timed out waiting for GPU timeline value {}", value);
                Ok(WaitOutcome::TimedOut)
            }
            Err(e) => Err(e).context("Failed to wait on GPU timeline"),
        }
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Signal a new value and wait for it, draining all previously
/// submitted GPU work. Required before destroying or resizing anything
/// an in-flight command list might still reference.
pub fn flush_gpu_queue<T: GpuTimeline>(timeline: &mut T) -> Result<u64> {
    let value = timeline.signal()?;
    timeline.wait(value, None)?;
    Ok(value)
}

/// Last required timeline value per frame slot.
///
/// Slot i's command pool may be reset only once the timeline has passed
/// `value_for(i)`.
pub struct FramePacer {
    slot_values: Box<[u64]>,
}

impl FramePacer {
    pub fn new(slots: usize) -> Self {
        Self {
            slot_values: vec![0; slots].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_values.len()
    }

    /// Record the value signaled for the slot that just submitted work.
    pub fn record_signal(&mut self, slot: usize, value: u64) {
        self.slot_values[slot] = value;
    }

    /// The timeline value that must be reached before this slot's
    /// resources can be reused.
    #[inline]
    pub fn value_for(&self, slot: usize) -> u64 {
        self.slot_values[slot]
    }

    /// Reset every slot to `value`. Only valid immediately after a
    /// flush, when everything at or below `value` is known complete.
    pub fn reset_all(&mut self, value: u64) {
        self.slot_values.fill(value);
    }
}

/// Binary semaphores for acquire/submit/present ordering, one pair per
/// frame slot.
pub struct FrameSync {
    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    device: Arc<RenderDevice>,
}

impl FrameSync {
    pub fn new(device: Arc<RenderDevice>, slots: usize) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let mut image_available = Vec::with_capacity(slots);
        let mut render_finished = Vec::with_capacity(slots);
        for _ in 0..slots {
            unsafe {
                image_available.push(
                    device
                        .device
                        .create_semaphore(&create_info, None)
                        .context("Failed to create acquire semaphore")?,
                );
                render_finished.push(
                    device
                        .device
                        .create_semaphore(&create_info, None)
                        .context("Failed to create present semaphore")?,
                );
            }
        }

        Ok(Self {
            image_available,
            render_finished,
            device,
        })
    }

    #[inline]
    pub fn image_available(&self, slot: usize) -> vk::Semaphore {
        self.image_available[slot]
    }

    #[inline]
    pub fn render_finished(&self, slot: usize) -> vk::Semaphore {
        self.render_finished[slot]
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            for &semaphore in self.image_available.iter().chain(&self.render_finished) {
                self.device.device.destroy_semaphore(semaphore, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;

    /// Host-side timeline standing in for a GPU queue. `wait` completes
    /// everything up to the target, like a GPU that always catches up.
    struct MockTimeline {
        next_value: u64,
        completed: RefCell<u64>,
        waits: RefCell<Vec<u64>>,
    }

    impl MockTimeline {
        fn new() -> Self {
            Self {
                next_value: 0,
                completed: RefCell::new(0),
                waits: RefCell::new(Vec::new()),
            }
        }

        fn waits(&self) -> Vec<u64> {
            self.waits.borrow().clone()
        }
    }

    impl GpuTimeline for MockTimeline {
        fn signal(&mut self) -> Result<u64> {
            self.next_value += 1;
            Ok(self.next_value)
        }

        fn completed_value(&self) -> Result<u64> {
            Ok(*self.completed.borrow())
        }

        fn wait(&self, value: u64, _timeout: Option<Duration>) -> Result<WaitOutcome> {
            self.waits.borrow_mut().push(value);
            let mut completed = self.completed.borrow_mut();
            *completed = (*completed).max(value);
            Ok(WaitOutcome::Complete)
        }
    }

    #[test]
    fn signal_increments_by_exactly_one() {
        let mut timeline = MockTimeline::new();
        let mut previous = 0;
        for _ in 0..100 {
            let value = timeline.signal().unwrap();
            assert_eq!(value, previous + 1);
            previous = value;
        }
    }

    #[test]
    fn flush_waits_on_the_value_it_signals() {
        let mut timeline = MockTimeline::new();
        timeline.signal().unwrap();
        timeline.signal().unwrap();

        let flushed = flush_gpu_queue(&mut timeline).unwrap();
        assert_eq!(flushed, 3);
        assert_eq!(timeline.waits(), vec![3]);
        assert!(timeline.completed_value().unwrap() >= flushed);
    }

    #[test]
    fn pacer_tracks_values_per_slot() {
        let mut pacer = FramePacer::new(3);
        assert_eq!(pacer.slot_count(), 3);
        assert_eq!(pacer.value_for(1), 0);

        pacer.record_signal(1, 7);
        assert_eq!(pacer.value_for(1), 7);
        assert_eq!(pacer.value_for(0), 0);
        assert_eq!(pacer.value_for(2), 0);
    }

    #[test]
    fn pacer_reset_applies_to_every_slot() {
        let mut pacer = FramePacer::new(4);
        pacer.record_signal(0, 5);
        pacer.record_signal(3, 9);

        pacer.reset_all(9);
        for slot in 0..4 {
            assert_eq!(pacer.value_for(slot), 9);
        }
    }

    #[test]
    fn pipelined_loop_never_reuses_a_slot_early() {
        // Drive the per-frame protocol: wait on the incoming slot's
        // recorded value, submit, signal, store. The slot index follows
        // the swapchain ring.
        let slots = 4;
        let mut timeline = MockTimeline::new();
        let mut pacer = FramePacer::new(slots);

        for frame in 0..20u64 {
            let slot = (frame % slots as u64) as usize;
            assert!(slot < pacer.slot_count());

            let required = pacer.value_for(slot);
            timeline.wait(required, None).unwrap();
            // Reusing the slot is legal only now
            assert!(timeline.completed_value().unwrap() >= required);

            let value = timeline.signal().unwrap();
            pacer.record_signal(slot, value);
        }

        // Values stay monotonic across the whole run
        assert_eq!(timeline.next_value, 20);
        let mut sorted = timeline.waits();
        sorted.sort_unstable();
        assert_eq!(sorted, timeline.waits());
    }

    #[test]
    fn resize_reset_keeps_later_waits_valid() {
        let slots = 2;
        let mut timeline = MockTimeline::new();
        let mut pacer = FramePacer::new(slots);

        for frame in 0..5u64 {
            let slot = (frame % slots as u64) as usize;
            timeline.wait(pacer.value_for(slot), None).unwrap();
            let value = timeline.signal().unwrap();
            pacer.record_signal(slot, value);
        }

        let flushed = flush_gpu_queue(&mut timeline).unwrap();
        pacer.reset_all(flushed);

        // Every slot is immediately reusable after the flush
        for slot in 0..slots {
            assert!(timeline.completed_value().unwrap() >= pacer.value_for(slot));
        }
    }
}
