use std::collections::BTreeMap;

use arrayvec::ArrayVec;
use ash::{prelude::VkResult, vk};

use super::{HostBuffer, StagingWriter};
use crate::{Access, BufferInfo, DeferredDestroyer, ResourceState, RtDevice};

pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

struct PendingWrite<T> {
    value: T,
    /// Number of host buffers that have yet to receive the value.
    remaining: usize,
}

/// An array of `T` records uploaded to a single device local buffer, staged through one host
/// buffer per frame in flight.
///
/// Each frame writes into the host buffer of the current frame only, so the CPU never touches
/// memory a copy from an earlier, possibly still executing frame reads from.
/// Writes made with [`UploadRing::write`] persist: they are replayed into every other host
/// buffer as it becomes current. [`UploadRing::write_frame`] and [`UploadRing::writer`] only
/// affect the current frame and are meant for data rewritten every frame.
///
/// `T` must be plain old data for which the all-zero bit pattern is valid.
pub struct UploadRing<D: RtDevice, T: Copy> {
    capacity: usize,
    host: ArrayVec<HostBuffer<D>, MAX_FRAMES_IN_FLIGHT>,
    device_buffer: D::Buffer,
    device_state: ResourceState,
    current: usize,
    pending: BTreeMap<usize, PendingWrite<T>>,
}

impl<D: RtDevice, T: Copy> UploadRing<D, T> {
    pub fn new(
        device: &D,
        name: &str,
        capacity: usize,
        frames_in_flight: usize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<Self> {
        assert!(
            (1..=MAX_FRAMES_IN_FLIGHT).contains(&frames_in_flight),
            "frames in flight must be within 1..={MAX_FRAMES_IN_FLIGHT}"
        );
        let size = (capacity.max(1) * std::mem::size_of::<T>()) as vk::DeviceSize;
        let mut host = ArrayVec::new();
        for _ in 0..frames_in_flight {
            match HostBuffer::new(device, size, name) {
                Ok(buffer) => {
                    debug_assert_eq!(
                        buffer.as_ptr().as_ptr() as usize % std::mem::align_of::<T>(),
                        0
                    );
                    host.push(buffer);
                }
                Err(err) => {
                    for buffer in host {
                        device.destroy_buffer(buffer.into_raw());
                    }
                    return Err(err);
                }
            }
        }
        let device_buffer = match device.create_buffer(&BufferInfo {
            size,
            usage: usage
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            host_visible: false,
            name,
        }) {
            Ok(buffer) => buffer,
            Err(err) => {
                for buffer in host {
                    device.destroy_buffer(buffer.into_raw());
                }
                return Err(err);
            }
        };
        Ok(Self {
            capacity,
            host,
            device_buffer,
            device_state: ResourceState::default(),
            current: 0,
            pending: BTreeMap::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn frames_in_flight(&self) -> usize {
        self.host.len()
    }
    pub fn current_frame(&self) -> usize {
        self.current
    }
    pub fn device_buffer(&self) -> &D::Buffer {
        &self.device_buffer
    }
    pub fn device_address(&self, device: &D) -> vk::DeviceAddress {
        device.buffer_device_address(&self.device_buffer)
    }
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Writer into the current frame's host buffer. Invalidated by [`UploadRing::advance`].
    pub fn writer(&self) -> StagingWriter<T> {
        StagingWriter::new(self.host[self.current].as_ptr().cast(), self.capacity)
    }

    /// Write into the current frame only.
    pub fn write_frame(&mut self, index: usize, value: T) {
        // SAFETY: `&mut self` excludes every other writer obtained from this ring being used
        // concurrently, as long as callers respect the `StagingWriter` contract.
        unsafe { self.writer().write(index, value) };
    }

    /// Write into the current frame and every subsequent frame until overwritten.
    pub fn write(&mut self, index: usize, value: T) {
        self.write_frame(index, value);
        let remaining = self.host.len() - 1;
        if remaining > 0 {
            self.pending.insert(index, PendingWrite { value, remaining });
        }
    }

    /// Value stored in the current frame's host buffer.
    pub fn read(&self, index: usize) -> T {
        self.read_frame(self.current, index)
    }

    /// Value stored in the host buffer of `frame`.
    pub fn read_frame(&self, frame: usize, index: usize) -> T {
        assert!(index < self.capacity);
        unsafe {
            self.host[frame]
                .as_ptr()
                .cast::<T>()
                .as_ptr()
                .add(index)
                .read()
        }
    }

    /// Switch to the next frame's host buffer and replay outstanding persistent writes into it.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.host.len();
        let writer = self.writer();
        self.pending.retain(|&index, pending| {
            unsafe { writer.write(index, pending.value) };
            pending.remaining -= 1;
            pending.remaining > 0
        });
    }

    /// Record a copy of the first `count` records of the current host buffer into the device
    /// buffer, followed by a barrier making them visible to `next`.
    /// Returns the number of bytes copied.
    pub fn flush(
        &mut self,
        device: &D,
        cmd: &mut D::CommandBuffer,
        count: usize,
        next: Access,
    ) -> vk::DeviceSize {
        if count == 0 {
            return 0;
        }
        assert!(
            count <= self.capacity,
            "flushing {count} records from a ring of capacity {}",
            self.capacity
        );
        let size = (count * std::mem::size_of::<T>()) as vk::DeviceSize;
        device.cmd_barrier_if_needed(cmd, self.device_state.transition(Access::COPY_WRITE));
        device.cmd_copy_buffer(
            cmd,
            self.host[self.current].raw(),
            &self.device_buffer,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            }],
        );
        device.cmd_barrier_if_needed(cmd, self.device_state.transition(next));
        tracing::trace!("Flushed {} bytes from staging frame {}", size, self.current);
        size
    }

    /// Hand every buffer to `destroyer`.
    pub fn retire(self, destroyer: &DeferredDestroyer<D>) {
        for buffer in self.host {
            destroyer.destroy_buffer(buffer.into_raw());
        }
        destroyer.destroy_buffer(self.device_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessCommand, HeadlessDevice};

    fn ring(device: &HeadlessDevice, frames: usize) -> UploadRing<HeadlessDevice, u64> {
        UploadRing::new(
            device,
            "test ring",
            8,
            frames,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )
        .unwrap()
    }

    #[test]
    fn test_persistent_write_reaches_every_frame() {
        let device = HeadlessDevice::new();
        let mut ring = ring(&device, 3);
        ring.write(2, 42);
        assert_eq!(ring.pending_writes(), 1);
        ring.advance();
        assert_eq!(ring.read(2), 42);
        ring.advance();
        assert_eq!(ring.read(2), 42);
        assert_eq!(ring.pending_writes(), 0);
        ring.advance();
        assert_eq!(ring.current_frame(), 0);
        assert_eq!(ring.read(2), 42);
    }

    #[test]
    fn test_frame_write_stays_in_frame() {
        let device = HeadlessDevice::new();
        let mut ring = ring(&device, 2);
        ring.write_frame(1, 7);
        ring.advance();
        assert_eq!(ring.read(1), 0);
        ring.advance();
        assert_eq!(ring.read(1), 7);
    }

    #[test]
    fn test_writes_after_advance_leave_previous_frame() {
        let device = HeadlessDevice::new();
        let mut ring = ring(&device, 2);
        ring.write(0, 1);
        let flushed = ring.current_frame();
        ring.advance();
        ring.write(0, 2);
        assert_eq!(ring.read_frame(flushed, 0), 1);
        assert_eq!(ring.read(0), 2);
    }

    #[test]
    fn test_newer_persistent_write_wins() {
        let device = HeadlessDevice::new();
        let mut ring = ring(&device, 2);
        ring.write(0, 1);
        ring.write(0, 2);
        ring.advance();
        assert_eq!(ring.read(0), 2);
    }

    #[test]
    fn test_flush_copies_written_prefix() {
        let device = HeadlessDevice::new();
        let mut ring = ring(&device, 2);
        for i in 0..3 {
            ring.write(i, i as u64 + 10);
        }
        let mut cmd = Vec::new();
        assert_eq!(ring.flush(&device, &mut cmd, 0, Access::RAY_TRACING_SHADER_READ), 0);
        assert!(cmd.is_empty());

        let copied = ring.flush(&device, &mut cmd, 3, Access::RAY_TRACING_SHADER_READ);
        assert_eq!(copied, 24);
        // First use of the device buffer: copy, then COPY_WRITE -> shader read.
        assert!(matches!(
            cmd.as_slice(),
            [
                HeadlessCommand::CopyBuffer { size: 24, .. },
                HeadlessCommand::Barrier(_)
            ]
        ));
        let contents: Vec<u64> = device.read_buffer(ring.device_buffer(), 0, 3);
        assert_eq!(contents, vec![10, 11, 12]);

        // The next copy has to wait for the shader reads of the previous one.
        cmd.clear();
        ring.advance();
        ring.flush(&device, &mut cmd, 3, Access::RAY_TRACING_SHADER_READ);
        assert!(matches!(
            cmd.as_slice(),
            [
                HeadlessCommand::Barrier(_),
                HeadlessCommand::CopyBuffer { .. },
                HeadlessCommand::Barrier(_)
            ]
        ));
    }

    #[test]
    fn test_writer_is_usable_from_threads() {
        let device = HeadlessDevice::new();
        let mut ring = ring(&device, 1);
        let writer = ring.writer();
        std::thread::scope(|scope| {
            for i in 0..4 {
                scope.spawn(move || unsafe {
                    writer.write(i * 2, i as u64);
                    writer.write(i * 2 + 1, i as u64);
                });
            }
        });
        assert_eq!(ring.read(7), 3);
        ring.write_frame(7, 9);
        assert_eq!(ring.read(7), 9);
    }
}
