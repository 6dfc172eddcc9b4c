use std::{collections::VecDeque, sync::Mutex};

use crate::RtDevice;

enum Retired<D: RtDevice> {
    Buffer(D::Buffer),
    AccelStruct(D::AccelStruct),
}

/// Holds GPU objects that may still be referenced by in-flight frames.
///
/// Objects retired during frame `n` are destroyed once `frames_in_flight` further frames
/// have been started, i.e. when the GPU can no longer be executing commands from frame `n`.
pub struct DeferredDestroyer<D: RtDevice> {
    frames_in_flight: u64,
    inner: Mutex<DeferredDestroyerInner<D>>,
}

struct DeferredDestroyerInner<D: RtDevice> {
    current_frame: u64,
    retired: VecDeque<(u64, Retired<D>)>,
}

impl<D: RtDevice> DeferredDestroyer<D> {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight as u64,
            inner: Mutex::new(DeferredDestroyerInner {
                current_frame: 0,
                retired: VecDeque::new(),
            }),
        }
    }

    pub fn destroy_buffer(&self, buffer: D::Buffer) {
        let mut guard = self.inner.lock().unwrap();
        let frame = guard.current_frame;
        guard.retired.push_back((frame, Retired::Buffer(buffer)));
    }

    pub fn destroy_accel_struct(&self, accel_struct: D::AccelStruct) {
        let mut guard = self.inner.lock().unwrap();
        let frame = guard.current_frame;
        guard
            .retired
            .push_back((frame, Retired::AccelStruct(accel_struct)));
    }

    /// Advance to `frame` and destroy everything that is no longer in flight.
    /// Returns the number of destroyed objects.
    pub fn set_frame(&self, device: &D, frame: u64) -> usize {
        let mut guard = self.inner.lock().unwrap();
        guard.current_frame = frame;
        let mut destroyed = 0;
        while let Some((retired_at, _)) = guard.retired.front() {
            if retired_at + self.frames_in_flight > frame {
                break;
            }
            let (_, object) = guard.retired.pop_front().unwrap();
            Self::destroy(device, object);
            destroyed += 1;
        }
        if destroyed > 0 {
            tracing::debug!("Destroyed {} retired GPU objects at frame {}", destroyed, frame);
        }
        destroyed
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().retired.len()
    }

    /// Destroy everything right away. The caller guarantees the GPU is idle.
    pub fn flush(&self, device: &D) {
        let mut guard = self.inner.lock().unwrap();
        for (_, object) in guard.retired.drain(..) {
            Self::destroy(device, object);
        }
    }

    fn destroy(device: &D, object: Retired<D>) {
        match object {
            Retired::Buffer(buffer) => device.destroy_buffer(buffer),
            Retired::AccelStruct(accel_struct) => device.destroy_accel_struct(accel_struct),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{headless::HeadlessDevice, BufferInfo};
    use ash::vk;

    fn buffer(device: &HeadlessDevice) -> <HeadlessDevice as RtDevice>::Buffer {
        device
            .create_buffer(&BufferInfo {
                size: 16,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                host_visible: false,
                name: "test",
            })
            .unwrap()
    }

    #[test]
    fn test_destroys_after_frames_in_flight() {
        let device = HeadlessDevice::new();
        let destroyer = DeferredDestroyer::<HeadlessDevice>::new(2);
        destroyer.destroy_buffer(buffer(&device));
        assert_eq!(destroyer.set_frame(&device, 1), 0);
        destroyer.destroy_buffer(buffer(&device));
        assert_eq!(destroyer.set_frame(&device, 2), 1);
        assert_eq!(destroyer.pending(), 1);
        assert_eq!(destroyer.set_frame(&device, 3), 1);
        assert_eq!(device.stats().live_buffers, 0);
    }

    #[test]
    fn test_flush() {
        let device = HeadlessDevice::new();
        let destroyer = DeferredDestroyer::<HeadlessDevice>::new(3);
        destroyer.destroy_buffer(buffer(&device));
        destroyer.destroy_buffer(buffer(&device));
        destroyer.flush(&device);
        assert_eq!(destroyer.pending(), 0);
        assert_eq!(device.stats().live_buffers, 0);
    }
}
