//! Multi-source audio mixing
//!
//! N device sources feed one track sink. Device threads push interleaved
//! f32 samples under the mixer's own mutex (distinct from the packet-ring
//! mutex); the drive loop pulls frames of exactly `frame_len` samples from
//! the sink. A lagging source is zero-padded for the current frame rather
//! than waited on, and its late samples simply play late; per-source queues
//! are capped so a dead source cannot grow memory without bound.

use std::collections::VecDeque;
use std::sync::Mutex;

pub struct AudioMixer {
    inner: Mutex<Inner>,
    /// Samples per pulled frame (samples-per-channel times channels).
    frame_len: usize,
    /// Per-source queue cap, in samples.
    capacity: usize,
}

struct Inner {
    sources: Vec<VecDeque<f32>>,
}

impl AudioMixer {
    pub fn new(source_count: usize, frame_len: usize, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sources: (0..source_count.max(1)).map(|_| VecDeque::new()).collect(),
            }),
            frame_len,
            capacity,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Queue samples from one source. Called from that source's device
    /// thread; drops the oldest samples when the cap is exceeded.
    pub fn push(&self, source: usize, samples: &[f32]) {
        let mut inner = self.inner.lock().unwrap();
        let Some(queue) = inner.sources.get_mut(source) else {
            return;
        };
        queue.extend(samples.iter().copied());
        let excess = queue.len().saturating_sub(self.capacity);
        if excess > 0 {
            queue.drain(..excess);
            log::trace!("audio source {} overflowed, dropped {} samples", source, excess);
        }
    }

    /// Mix one frame into `out`. Returns false until at least one source
    /// has a full frame queued; sources with less contribute what they have
    /// and are zero-padded for the remainder.
    pub fn pull_frame(&self, out: &mut Vec<f32>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.sources.iter().any(|q| q.len() >= self.frame_len) {
            return false;
        }

        out.clear();
        out.resize(self.frame_len, 0.0);
        for queue in inner.sources.iter_mut() {
            let n = queue.len().min(self.frame_len);
            for (slot, sample) in out.iter_mut().zip(queue.drain(..n)) {
                *slot += sample;
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_source_passes_through() {
        let mixer = AudioMixer::new(1, 4, 64);
        let mut out = Vec::new();

        assert!(!mixer.pull_frame(&mut out));
        mixer.push(0, &[0.1, 0.2, 0.3]);
        assert!(!mixer.pull_frame(&mut out), "partial frame must not mix");

        mixer.push(0, &[0.4]);
        assert!(mixer.pull_frame(&mut out));
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_two_sources_sum() {
        let mixer = AudioMixer::new(2, 2, 64);
        mixer.push(0, &[0.25, 0.25]);
        mixer.push(1, &[0.5, -0.5]);

        let mut out = Vec::new();
        assert!(mixer.pull_frame(&mut out));
        assert_eq!(out, vec![0.75, -0.25]);
    }

    #[test]
    fn test_lagging_source_is_zero_padded_not_waited_on() {
        let mixer = AudioMixer::new(2, 4, 64);
        mixer.push(0, &[1.0, 1.0, 1.0, 1.0]);
        mixer.push(1, &[0.5]); // behind by three samples

        let mut out = Vec::new();
        assert!(mixer.pull_frame(&mut out));
        // The straggler contributed its one sample (clamped sum on slot 0)
        // and silence after
        assert_eq!(out, vec![1.0, 1.0, 1.0, 1.0]);

        // Its late samples mix into the next frame instead of being dropped
        mixer.push(1, &[0.5, 0.5, 0.5]);
        mixer.push(0, &[0.0, 0.0, 0.0, 0.0]);
        assert!(mixer.pull_frame(&mut out));
        assert_eq!(out, vec![0.5, 0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_mix_clamps_to_unit_range() {
        let mixer = AudioMixer::new(2, 2, 64);
        mixer.push(0, &[0.9, -0.9]);
        mixer.push(1, &[0.9, -0.9]);

        let mut out = Vec::new();
        assert!(mixer.pull_frame(&mut out));
        assert_eq!(out, vec![1.0, -1.0]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mixer = AudioMixer::new(1, 2, 4);
        mixer.push(0, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let mut out = Vec::new();
        assert!(mixer.pull_frame(&mut out));
        assert_eq!(out, vec![3.0, 4.0]);
    }

    #[test]
    fn test_concurrent_pushers() {
        let mixer = Arc::new(AudioMixer::new(2, 64, 48_000));
        let handles: Vec<_> = (0..2)
            .map(|source| {
                let mixer = Arc::clone(&mixer);
                thread::spawn(move || {
                    for _ in 0..100 {
                        mixer.push(source, &[0.1; 32]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut out = Vec::new();
        let mut frames = 0;
        while mixer.pull_frame(&mut out) {
            assert_eq!(out.len(), 64);
            frames += 1;
        }
        // 3200 samples per source, frame of 64: 50 frames
        assert_eq!(frames, 50);
    }
}
