//! A bounded FIFO of encoded frames, stored inline.

use arrayvec::ArrayVec;

/// Why a frame was refused by a [`FrameQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("the outbound queue is full")]
    Full,
    #[error("frame of {len} bytes does not fit in a {capacity} byte queue entry")]
    TooLarge { len: usize, capacity: usize },
}

/// Up to `N` frames of up to `FRAME` bytes each.
///
/// Frames are only ever removed from the front, after they have been sent.
/// Nothing is overwritten: pushing into a full queue fails.
#[derive(Debug, Clone, Default)]
pub struct FrameQueue<const FRAME: usize, const N: usize> {
    entries: ArrayVec<ArrayVec<u8, FRAME>, N>,
}

impl<const FRAME: usize, const N: usize> FrameQueue<FRAME, N> {
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            entries: ArrayVec::new_const(),
        }
    }

    /// Copies `frame` to the back of the queue.
    pub fn push(&mut self, frame: &[u8]) -> Result<(), EnqueueError> {
        if frame.len() > FRAME {
            return Err(EnqueueError::TooLarge {
                len: frame.len(),
                capacity: FRAME,
            });
        }

        if self.entries.is_full() {
            return Err(EnqueueError::Full);
        }

        let mut entry = ArrayVec::new_const();
        // can't fail, the length was checked above
        let _ = entry.try_extend_from_slice(frame);
        self.entries.push(entry);

        Ok(())
    }

    /// The oldest frame, the next one to send.
    #[inline]
    pub fn front(&self) -> Option<&[u8]> {
        self.entries.first().map(ArrayVec::as_slice)
    }

    /// Removes the oldest frame. Returns `false` if the queue was empty.
    #[inline]
    pub fn pop_front(&mut self) -> bool {
        if self.entries.is_empty() {
            false
        } else {
            self.entries.remove(0);
            true
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    #[inline(always)]
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = FrameQueue::<8, 3>::new();
        q.push(b"one").unwrap();
        q.push(b"two").unwrap();

        assert_eq!(q.front(), Some(&b"one"[..]));
        assert!(q.pop_front());
        assert_eq!(q.front(), Some(&b"two"[..]));
        assert!(q.pop_front());
        assert!(!q.pop_front());
        assert!(q.front().is_none());
    }

    #[test]
    fn full_queue_refuses_without_overwriting() {
        let mut q = FrameQueue::<8, 2>::new();
        q.push(b"a").unwrap();
        q.push(b"b").unwrap();

        assert_eq!(q.push(b"c"), Err(EnqueueError::Full));
        assert_eq!(q.len(), 2);
        assert_eq!(q.front(), Some(&b"a"[..]));
    }

    #[test]
    fn oversized_frame_is_refused() {
        let mut q = FrameQueue::<4, 2>::new();
        assert_eq!(
            q.push(b"12345"),
            Err(EnqueueError::TooLarge {
                len: 5,
                capacity: 4
            })
        );
        assert!(q.is_empty());
        q.push(b"1234").unwrap();
    }
}
