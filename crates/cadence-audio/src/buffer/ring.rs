//! Lock-free ring of f32 samples between one producer and one consumer.
//!
//! The sink's writer side fills it and the stream callback drains it, so the
//! callback never waits on a lock. Slots hold sample bit patterns in atomics;
//! the positions only ever grow and are masked into the slot array.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Single-producer single-consumer sample ring.
pub struct RingBuffer {
    slots: Box<[AtomicU32]>,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
    capacity: usize,
    mask: usize,
}

impl RingBuffer {
    /// Create a ring holding at least `capacity` samples.
    ///
    /// The capacity is rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            capacity,
            mask: capacity - 1,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples waiting to be read.
    pub fn available(&self) -> usize {
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        write_pos.wrapping_sub(read_pos)
    }

    /// Room for more samples.
    pub fn free(&self) -> usize {
        self.capacity - self.available()
    }

    /// Append as many of `samples` as fit. Producer side only.
    pub fn write(&self, samples: &[f32]) -> usize {
        let write_pos = self.write_pos.load(Ordering::Relaxed);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        let free = self.capacity - write_pos.wrapping_sub(read_pos);
        let n = samples.len().min(free);

        for (i, sample) in samples[..n].iter().enumerate() {
            self.slots[write_pos.wrapping_add(i) & self.mask].store(sample.to_bits(), Ordering::Relaxed);
        }
        self.write_pos.store(write_pos.wrapping_add(n), Ordering::Release);
        n
    }

    /// Fill the front of `out` with the oldest samples, each passed through
    /// `map`. Consumer side only. Returns how many were read.
    pub fn read_map<T>(&self, out: &mut [T], map: impl Fn(f32) -> T) -> usize {
        let read_pos = self.read_pos.load(Ordering::Relaxed);
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let n = out.len().min(write_pos.wrapping_sub(read_pos));

        for (i, slot) in out[..n].iter_mut().enumerate() {
            let bits = self.slots[read_pos.wrapping_add(i) & self.mask].load(Ordering::Relaxed);
            *slot = map(f32::from_bits(bits));
        }
        self.read_pos.store(read_pos.wrapping_add(n), Ordering::Release);
        n
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;
    use std::sync::Arc;

    fn read(ring: &RingBuffer, out: &mut [f32]) -> usize {
        ring.read_map(out, |sample| sample)
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_basic_write_read() {
        let ring = RingBuffer::new(1024);

        let samples = [0.1f32, -0.2, 0.3, -0.4, 0.5];
        assert_eq!(ring.write(&samples), 5);
        assert_eq!(ring.available(), 5);

        let mut output = [0.0f32; 5];
        assert_eq!(read(&ring, &mut output), 5);
        assert_eq!(output, samples);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(RingBuffer::new(5).capacity(), 8);
        assert_eq!(RingBuffer::new(8).capacity(), 8);
        assert_eq!(RingBuffer::new(0).capacity(), 1);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_wraparound() {
        let ring = RingBuffer::new(8);

        assert_eq!(ring.write(&[1.0; 6]), 6);
        let mut output = [0.0f32; 4];
        assert_eq!(read(&ring, &mut output), 4);

        // Crosses the end of the slot array.
        assert_eq!(ring.write(&[2.0; 5]), 5);
        let mut rest = [0.0f32; 8];
        assert_eq!(read(&ring, &mut rest), 7);
        assert_eq!(&rest[..2], &[1.0, 1.0]);
        assert_eq!(&rest[2..7], &[2.0; 5]);
    }

    #[test]
    fn test_full_ring_takes_nothing() {
        let ring = RingBuffer::new(4);

        assert_eq!(ring.write(&[1.0; 6]), 4);
        assert_eq!(ring.available(), 4);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.write(&[2.0]), 0);

        let mut output = [0.0f32; 1];
        read(&ring, &mut output);
        assert_eq!(ring.write(&[2.0]), 1);
    }

    #[test]
    fn test_read_map_converts_in_place() {
        let ring = RingBuffer::new(4);
        ring.write(&[0.5, -1.0]);

        let mut output = [7i16; 3];
        let read = ring.read_map(&mut output, |s| (s * 32_768.0) as i16);
        assert_eq!(read, 2);
        assert_eq!(output, [16_384, -32_768, 7]);
    }

    #[test]
    #[allow(clippy::float_cmp, clippy::cast_precision_loss)]
    fn test_concurrent_access_keeps_order() {
        const TOTAL: usize = 10_000;
        let ring = Arc::new(RingBuffer::new(64));
        let producer = Arc::clone(&ring);

        let writer = std::thread::spawn(move || {
            let samples: Vec<f32> = (0..TOTAL).map(|i| i as f32).collect();
            let mut sent = 0;
            while sent < TOTAL {
                let n = producer.write(&samples[sent..(sent + 50).min(TOTAL)]);
                if n == 0 {
                    std::thread::yield_now();
                }
                sent += n;
            }
        });

        let mut received = Vec::with_capacity(TOTAL);
        let mut output = [0.0f32; 37];
        while received.len() < TOTAL {
            let n = read(&ring, &mut output);
            if n == 0 {
                std::thread::yield_now();
            }
            received.extend_from_slice(&output[..n]);
        }
        writer.join().unwrap();

        assert!(received.iter().enumerate().all(|(i, s)| *s == i as f32));
        assert_eq!(ring.available(), 0);
    }
}
