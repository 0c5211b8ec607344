use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::frame::EncodedFrame;

/// Single-cell, latest-wins hand-off between the capture loop and HTTP readers.
///
/// The lock only guards an `Option` of a reference-counted buffer: publishing
/// swaps it, reading clones the handle. Neither ever holds the lock across an
/// await point or while bytes are copied, so readers and the writer contend
/// for a few instructions at most. There is no history: a reader may see the
/// same frame twice or skip frames that were overwritten in between.
#[derive(Debug, Default)]
pub struct FrameSlot {
    current: Mutex<Option<EncodedFrame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame. The previous value is dropped outside the lock.
    pub fn publish(&self, frame: EncodedFrame) {
        let previous = self.lock().replace(frame);
        drop(previous);
    }

    /// The most recently published frame, or `None` before the first publish.
    pub fn read(&self) -> Option<EncodedFrame> {
        self.lock().clone()
    }

    pub fn has_frame(&self) -> bool {
        self.lock().is_some()
    }

    // A panicking holder cannot leave a half-written value behind (the only
    // mutation is a whole-value replace), so a poisoned lock is still sound.
    fn lock(&self) -> MutexGuard<'_, Option<EncodedFrame>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    fn frame(seq: u64, len: usize) -> EncodedFrame {
        EncodedFrame::new(vec![(seq % 251) as u8; len], seq, seq as i64)
    }

    #[test]
    fn starts_empty() {
        let slot = FrameSlot::new();
        assert!(slot.read().is_none());
        assert!(!slot.has_frame());
    }

    #[test]
    fn latest_publish_wins() {
        let slot = FrameSlot::new();
        slot.publish(frame(1, 4));
        slot.publish(frame(2, 8));
        let got = slot.read().unwrap();
        assert_eq!(got.seq, 2);
        assert_eq!(got.len(), 8);
        assert!(slot.has_frame());
    }

    #[test]
    fn reads_do_not_consume() {
        let slot = FrameSlot::new();
        slot.publish(frame(7, 3));
        assert_eq!(slot.read().unwrap().seq, 7);
        assert_eq!(slot.read().unwrap().seq, 7);
    }

    #[test]
    fn concurrent_readers_never_see_torn_frames() {
        const PUBLISHES: u64 = 5_000;
        const READERS: usize = 4;

        let slot = Arc::new(FrameSlot::new());

        // Every published frame has a distinct length and fill byte derived
        // from its seq, so any mix of two frames is detectable.
        let expected: HashMap<u64, EncodedFrame> = (0..PUBLISHES)
            .map(|seq| (seq, frame(seq, 16 + (seq as usize % 97))))
            .collect();
        let expected = Arc::new(expected);

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let slot = Arc::clone(&slot);
                let expected = Arc::clone(&expected);
                thread::spawn(move || {
                    let mut last_seq = None;
                    let mut observed = 0u64;
                    while last_seq != Some(PUBLISHES - 1) {
                        if let Some(got) = slot.read() {
                            let published = expected
                                .get(&got.seq)
                                .expect("reader saw a frame that was never published");
                            assert_eq!(&got, published);
                            if let Some(prev) = last_seq {
                                assert!(got.seq >= prev, "reader went back in time");
                            }
                            last_seq = Some(got.seq);
                            observed += 1;
                        }
                    }
                    observed
                })
            })
            .collect();

        for seq in 0..PUBLISHES {
            slot.publish(expected[&seq].clone());
        }

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        assert_eq!(slot.read().unwrap().seq, PUBLISHES - 1);
    }
}
