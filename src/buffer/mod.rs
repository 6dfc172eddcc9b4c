mod staging;

pub use staging::*;

use std::{marker::PhantomData, ptr::NonNull};

use ash::{prelude::VkResult, vk};

use crate::{BufferInfo, RtDevice};

/// A persistently mapped, host visible buffer.
pub struct HostBuffer<D: RtDevice> {
    buffer: D::Buffer,
    ptr: NonNull<u8>,
    size: vk::DeviceSize,
}
unsafe impl<D: RtDevice> Send for HostBuffer<D> {}
unsafe impl<D: RtDevice> Sync for HostBuffer<D> {}

impl<D: RtDevice> HostBuffer<D> {
    /// Create a zero-initialized host buffer usable as a transfer source.
    pub fn new(device: &D, size: vk::DeviceSize, name: &str) -> VkResult<Self> {
        let buffer = device.create_buffer(&BufferInfo {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            host_visible: true,
            name,
        })?;
        let Some(ptr) = device.mapped_ptr(&buffer) else {
            device.destroy_buffer(buffer);
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        };
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, size as usize);
        }
        Ok(Self { buffer, ptr, size })
    }
    pub fn raw(&self) -> &D::Buffer {
        &self.buffer
    }
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
    pub fn into_raw(self) -> D::Buffer {
        self.buffer
    }
}

/// Unsynchronized element access into a mapped staging buffer, shareable across threads.
///
/// This mirrors what a mapped pointer is on the GPU side: nothing stops two threads from
/// writing the same element, so callers partition the index space between themselves.
pub struct StagingWriter<T> {
    ptr: NonNull<T>,
    len: usize,
    _marker: PhantomData<T>,
}
unsafe impl<T: Send> Send for StagingWriter<T> {}
unsafe impl<T: Send> Sync for StagingWriter<T> {}
impl<T> Clone for StagingWriter<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for StagingWriter<T> {}

impl<T: Copy> StagingWriter<T> {
    pub(crate) fn new(ptr: NonNull<T>, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Modify element `index` in place.
    ///
    /// # Safety
    /// - No other thread may access element `index` while this call runs.
    /// - The buffer this writer was obtained from must stay alive and must not be flushed or
    ///   advanced to another frame until every outstanding write finished.
    pub unsafe fn update(&self, index: usize, f: impl FnOnce(&mut T)) {
        assert!(index < self.len, "staging write out of range: {index} >= {}", self.len);
        f(&mut *self.ptr.as_ptr().add(index));
    }

    /// # Safety
    /// Same as [`StagingWriter::update`].
    pub unsafe fn write(&self, index: usize, value: T) {
        self.update(index, |dst| *dst = value);
    }
}
