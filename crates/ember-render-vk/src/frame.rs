// SPDX-License-Identifier: CEPL-1.0
//! Frame slots and the acquire / record / submit ring.

use ash::prelude::VkResult;
use ash::vk;

use crate::error::FrameError;
use crate::sync::create_fence;

/// Per-slot GPU resources, allocated once and reused every N frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameSlot {
    pub cmd_pool: vk::CommandPool,
    pub cmd_main: vk::CommandBuffer,
    pub cmd_init: vk::CommandBuffer,
    pub fence: vk::Fence,
    /// The init buffer has been begun and not yet submitted.
    pub has_init_commands: bool,
}

impl FrameSlot {
    /// # Safety
    /// `device` must be a live logical device owning `queue_family`.
    pub unsafe fn new(device: &ash::Device, queue_family: u32) -> VkResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        unsafe {
            let cmd_pool = device.create_command_pool(&pool_info, None)?;
            let alloc = vk::CommandBufferAllocateInfo::default()
                .command_pool(cmd_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(2);
            let buffers = match device.allocate_command_buffers(&alloc) {
                Ok(b) => b,
                Err(e) => {
                    device.destroy_command_pool(cmd_pool, None);
                    return Err(e);
                }
            };
            // Signalled so the first wait on this slot returns immediately.
            let fence = match create_fence(device, true) {
                Ok(f) => f,
                Err(e) => {
                    device.free_command_buffers(cmd_pool, &buffers);
                    device.destroy_command_pool(cmd_pool, None);
                    return Err(e);
                }
            };
            Ok(Self {
                cmd_pool,
                cmd_main: buffers[0],
                cmd_init: buffers[1],
                fence,
                has_init_commands: false,
            })
        }
    }

    /// Frees the buffers before their pool. Safe to call twice.
    ///
    /// # Safety
    /// The slot's work must have completed.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if self.cmd_pool != vk::CommandPool::null() {
                device.free_command_buffers(self.cmd_pool, &[self.cmd_main, self.cmd_init]);
                device.destroy_command_pool(self.cmd_pool, None);
            }
            if self.fence != vk::Fence::null() {
                device.destroy_fence(self.fence, None);
            }
        }
        *self = Self::default();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    Recording { image_index: u32 },
    /// Waiting for the GPU; the slot's fence tells when it is done.
    Submitted,
}

/// CPU-side bookkeeping of the ring. Holds no GPU handles so the state
/// machine can be driven without a device.
#[derive(Debug)]
pub struct FrameRing {
    states: Vec<SlotState>,
    in_flight: Vec<Option<u64>>,
    current: usize,
    next_generation: u64,
    retired: u64,
}

impl FrameRing {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            states: vec![SlotState::Idle; slots],
            in_flight: vec![None; slots],
            current: 0,
            next_generation: 1,
            retired: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    /// Highest submission generation known to have finished on the GPU.
    pub fn retired(&self) -> u64 {
        self.retired
    }

    /// Generation of the submission the current slot is still waiting on.
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight[self.current]
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.states[self.current], SlotState::Recording { .. })
    }

    /// Enter `Acquiring`. A frame that is already open is rejected.
    pub fn begin_acquire(&mut self) -> Result<usize, FrameError> {
        match self.states[self.current] {
            SlotState::Acquiring | SlotState::Recording { .. } => Err(FrameError::Reentrant),
            SlotState::Idle | SlotState::Submitted => {
                self.states[self.current] = SlotState::Acquiring;
                Ok(self.current)
            }
        }
    }

    /// Acquisition failed; the slot goes back to where it was.
    pub fn acquire_failed(&mut self) {
        if self.states[self.current] == SlotState::Acquiring {
            self.states[self.current] = if self.in_flight[self.current].is_some() {
                SlotState::Submitted
            } else {
                SlotState::Idle
            };
        }
    }

    /// Drops an open frame without submitting it.
    pub fn abandon(&mut self) {
        if matches!(
            self.states[self.current],
            SlotState::Acquiring | SlotState::Recording { .. }
        ) {
            self.states[self.current] = SlotState::Acquiring;
            self.acquire_failed();
        }
    }

    pub fn acquired(&mut self, image_index: u32) {
        self.states[self.current] = SlotState::Recording { image_index };
    }

    /// The current slot's fence has signalled: everything it submitted is done.
    pub fn retire_current(&mut self) -> u64 {
        if let Some(generation) = self.in_flight[self.current].take() {
            self.retired = self.retired.max(generation);
        }
        self.retired
    }

    /// The whole queue is idle.
    pub fn retire_all(&mut self) -> u64 {
        for slot in 0..self.states.len() {
            if let Some(generation) = self.in_flight[slot].take() {
                self.retired = self.retired.max(generation);
            }
            if self.states[slot] == SlotState::Submitted {
                self.states[slot] = SlotState::Idle;
            }
        }
        self.retired
    }

    pub fn image_index(&self) -> Result<u32, FrameError> {
        match self.states[self.current] {
            SlotState::Recording { image_index } => Ok(image_index),
            _ => Err(FrameError::NotRecording),
        }
    }

    /// Marks the current slot submitted under a fresh generation and advances
    /// to the next slot. Returns the slot and its generation.
    pub fn submit(&mut self) -> Result<(usize, u64), FrameError> {
        self.image_index()?;
        let slot = self.current;
        let generation = self.next_generation;
        self.next_generation += 1;
        self.states[slot] = SlotState::Submitted;
        self.in_flight[slot] = Some(generation);
        self.current = (slot + 1) % self.states.len();
        Ok((slot, generation))
    }
}

/// Submission order within one batch: init, then queued buffers in the order
/// they were queued, then the main buffer.
pub fn assemble_submission(
    init: Option<vk::CommandBuffer>,
    queued: &[vk::CommandBuffer],
    main: vk::CommandBuffer,
) -> Vec<vk::CommandBuffer> {
    let mut out = Vec::with_capacity(queued.len() + 2);
    out.extend(init);
    out.extend_from_slice(queued);
    out.push(main);
    out
}
