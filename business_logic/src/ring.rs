//! Fixed-capacity history ring. Pushing into a full ring overwrites the
//! oldest entry, so memory use never grows past `N` entries.

#[derive(Debug, Clone)]
pub struct Ring<T: Copy, const N: usize> {
    buf: [Option<T>; N],
    head: usize, // Index the next entry is written to.
    len: usize,
}

impl<T: Copy, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize> Ring<T, N> {
    pub fn new() -> Self {
        Self { buf: [None; N], head: 0, len: 0 }
    }

    /// Add an entry, returning the one it evicted, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        if N == 0 {
            return Some(item);
        }
        let evicted = if self.len == N { self.buf[self.head] } else { None };
        self.buf[self.head] = Some(item);
        self.head = (self.head + 1) % N;
        if self.len < N {
            self.len += 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Iterate entries oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let start = (self.head + N - self.len) % N.max(1);
        (0..self.len).filter_map(move |i| self.buf[(start + i) % N].as_ref())
    }

    pub fn clear(&mut self) {
        self.buf = [None; N];
        self.head = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fills_then_overwrites_oldest() {
        let mut ring: Ring<u32, 3> = Ring::new();
        assert!(ring.is_empty());
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), None);
        assert_eq!(ring.len(), 3);

        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.len(), 3);
        let kept: [u32; 3] = [2, 3, 4];
        assert!(ring.iter().copied().eq(kept.iter().copied()));
        assert_eq!(ring.iter().last(), Some(&4));
    }

    #[test]
    fn test_partial_ring_iterates_in_order() {
        let mut ring: Ring<u32, 5> = Ring::new();
        ring.push(7);
        ring.push(8);
        assert!(ring.iter().copied().eq([7, 8].iter().copied()));
        assert_eq!(ring.iter().last(), Some(&8));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut ring: Ring<u32, 4> = Ring::new();
        for i in 0..100 {
            ring.push(i);
            assert!(ring.len() <= ring.capacity());
        }
        assert!(ring.iter().copied().eq(96..100));
    }

    #[test]
    fn test_clear() {
        let mut ring: Ring<u32, 2> = Ring::new();
        ring.push(1);
        ring.push(2);
        ring.push(3);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.iter().count(), 0);
    }
}
