//! Age-bounded, keyframe-aligned packet ring
//!
//! All encoder output threads append; the save path snapshots; eviction
//! runs inline after video appends. One mutex covers all three, held only
//! for queue work, never across I/O or encode calls.

use super::StreamPacket;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct ReplayRing {
    inner: Mutex<RingInner>,
    window: Duration,
}

struct RingInner {
    packets: VecDeque<StreamPacket>,
    /// Set once eviction has permanently dropped data; changes save
    /// semantics (timestamps must be rebased to zero).
    frames_erased: bool,
}

/// Deep copy of the ring taken under the mutex for one save job.
#[derive(Debug)]
pub struct ReplaySlice {
    pub packets: Vec<StreamPacket>,
    /// Index of the first video keyframe; saves start here.
    pub start_index: usize,
    pub video_pts_offset: i64,
    pub audio_pts_offset: i64,
}

impl ReplayRing {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                packets: VecDeque::new(),
                frames_erased: false,
            }),
            window,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one packet. Eviction is checked inline after video packets,
    /// by whichever thread appended.
    pub fn append(&self, packet: StreamPacket, now: Instant) {
        let is_video = packet.is_video();
        let mut inner = self.inner.lock().unwrap();
        inner.packets.push_back(packet);

        if is_video {
            while let Some(front) = inner.packets.front() {
                if now.duration_since(front.recorded_at) > self.window {
                    inner.packets.pop_front();
                    inner.frames_erased = true;
                } else {
                    break;
                }
            }
        }
    }

    /// Age of the oldest queued packet.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        inner
            .packets
            .front()
            .map(|p| now.duration_since(p.recorded_at))
    }

    /// Copy the ring for a save. Returns None when no video keyframe is
    /// buffered yet; the caller treats that as "insufficient data".
    pub fn snapshot(&self) -> Option<ReplaySlice> {
        let inner = self.inner.lock().unwrap();
        let start_index = inner
            .packets
            .iter()
            .position(|p| p.is_video() && p.keyframe)?;

        let (video_pts_offset, audio_pts_offset) = if inner.frames_erased {
            let video = inner.packets[start_index].pts;
            let audio = inner
                .packets
                .iter()
                .skip(start_index)
                .find(|p| !p.is_video())
                .map(|p| p.pts)
                .unwrap_or(0);
            (video, audio)
        } else {
            (0, 0)
        };

        Some(ReplaySlice {
            packets: inner.packets.iter().cloned().collect(),
            start_index,
            video_pts_offset,
            audio_pts_offset,
        })
    }

    /// Drop all buffered packets. Called after a save completes so the next
    /// save starts from fresh data.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.packets.clear();
        inner.frames_erased = false;
    }
}
