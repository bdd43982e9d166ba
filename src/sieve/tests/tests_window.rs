//! Window placement, coalescing and flush behaviour of the sieve buffer.
//!
//! Every test runs against a `MemStore` wrapped in a counter so that the
//! number of physical transfers can be asserted alongside the bytes.

#[cfg(test)]
mod tests {
    use crate::sieve::{Extent, SieveBuffer};
    use crate::store::{BlockStore, MemStore, MemType, StoreError, alloc};
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    // --------------------------------------------------------------------------------------------
    // Helpers
    // --------------------------------------------------------------------------------------------

    /// Counts physical transfers reaching the inner store.
    #[derive(Default)]
    struct CountingStore {
        inner: MemStore,
        reads: std::cell::Cell<usize>,
        writes: usize,
    }

    impl BlockStore for CountingStore {
        fn read(&self, mem: MemType, addr: u64, buf: &mut [u8]) -> Result<(), StoreError> {
            self.reads.set(self.reads.get() + 1);
            self.inner.read(mem, addr, buf)
        }
        fn write(&mut self, mem: MemType, addr: u64, buf: &[u8]) -> Result<(), StoreError> {
            self.writes += 1;
            self.inner.write(mem, addr, buf)
        }
        fn get_eoa(&self, mem: MemType) -> u64 {
            self.inner.get_eoa(mem)
        }
        fn set_eoa(&mut self, mem: MemType, addr: u64) -> Result<(), StoreError> {
            self.inner.set_eoa(mem, addr)
        }
        fn get_eof(&self, mem: MemType) -> u64 {
            self.inner.get_eof(mem)
        }
        fn truncate(&mut self) -> Result<(), StoreError> {
            self.inner.truncate()
        }
    }

    /// A store holding one dataset of `size` bytes filled with `0..size`.
    fn setup(size: u64) -> (CountingStore, Extent) {
        let mut store = CountingStore::default();
        let addr = alloc(&mut store, MemType::Draw, size).unwrap();
        let bytes: Vec<u8> = (0..size).map(|i| i as u8).collect();
        store.inner.write(MemType::Draw, addr, &bytes).unwrap();
        (store, Extent { addr, size })
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// # Scenario
    /// Small reads inside one window are served from memory.
    ///
    /// # Starting environment
    /// 256-byte dataset, 64-byte sieve.
    ///
    /// # Actions
    /// 1. Read 4 bytes at offset 8 (positions the window).
    /// 2. Read 4 bytes at offset 40.
    ///
    /// # Expected behavior
    /// Only the first read reaches the store; the window is `[0+8, 8+64)`.
    #[test]
    fn test_read_hit_after_fill() {
        init_tracing();
        let (mut store, ext) = setup(256);
        let mut sieve = SieveBuffer::new(64);
        let mut out = [0u8; 4];

        sieve.read(&mut store, ext, 8, &mut out).unwrap();
        assert_eq!(out, [8, 9, 10, 11]);
        sieve.read(&mut store, ext, 40, &mut out).unwrap();
        assert_eq!(out, [40, 41, 42, 43]);

        assert_eq!(store.reads.get(), 1);
        assert_eq!(sieve.window(), Some((8, 64)));
        assert!(!sieve.is_dirty());
    }

    /// # Scenario
    /// The window is clamped to the dataset end and to the EOA.
    ///
    /// # Starting environment
    /// 100-byte dataset, 64-byte sieve.
    ///
    /// # Actions
    /// 1. Read 1 byte at offset 90.
    ///
    /// # Expected behavior
    /// The window covers only the 10 remaining bytes of the dataset.
    #[test]
    fn test_window_clamped_to_dataset_end() {
        init_tracing();
        let (mut store, ext) = setup(100);
        let mut sieve = SieveBuffer::new(64);
        let mut out = [0u8; 1];

        sieve.read(&mut store, ext, 90, &mut out).unwrap();
        assert_eq!(out, [90]);
        assert_eq!(sieve.window(), Some((90, 10)));
    }

    /// # Scenario
    /// A read larger than the capacity bypasses the buffer but flushes an
    /// overlapping dirty window first.
    ///
    /// # Starting environment
    /// 256-byte dataset, 16-byte sieve holding a dirty window at offset 0.
    ///
    /// # Actions
    /// 1. Write 2 bytes at offset 0 (dirty window).
    /// 2. Read 32 bytes at offset 0.
    ///
    /// # Expected behavior
    /// The read sees the written bytes; the window stays valid but clean.
    #[test]
    fn test_large_read_flushes_overlapping_dirty_window() {
        init_tracing();
        let (mut store, ext) = setup(256);
        let mut sieve = SieveBuffer::new(16);

        sieve.write(&mut store, ext, 0, &[0xAA, 0xBB]).unwrap();
        assert!(sieve.is_dirty());

        let mut out = [0u8; 32];
        sieve.read(&mut store, ext, 0, &mut out).unwrap();
        assert_eq!(&out[..3], &[0xAA, 0xBB, 2]);
        assert!(!sieve.is_dirty());
        assert_eq!(sieve.window(), Some((0, 16)));
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// # Scenario
    /// Sequential small writes into one window produce a single flush.
    ///
    /// # Starting environment
    /// 256-byte dataset, 64-byte sieve.
    ///
    /// # Actions
    /// 1. Write 8 bytes at offsets 0, 8, 16, 24.
    /// 2. Flush.
    ///
    /// # Expected behavior
    /// Exactly one physical write, and the store reflects all four writes.
    #[test]
    fn test_writes_coalesce_into_one_flush() {
        init_tracing();
        let (mut store, ext) = setup(256);
        let mut sieve = SieveBuffer::new(64);

        for i in 0..4u64 {
            sieve.write(&mut store, ext, i * 8, &[0xF0 | i as u8; 8]).unwrap();
        }
        assert_eq!(store.writes, 0);
        sieve.flush(&mut store).unwrap();
        assert_eq!(store.writes, 1);

        let mut out = [0u8; 33];
        store.read(MemType::Draw, 0, &mut out).unwrap();
        assert_eq!(&out[..8], &[0xF0; 8]);
        assert_eq!(&out[24..32], &[0xF3; 8]);
        assert_eq!(out[32], 32);
    }

    /// # Scenario
    /// An adjacent write that would overflow the capacity repositions the
    /// window instead of extending it.
    ///
    /// # Starting environment
    /// 256-byte dataset, 32-byte sieve.
    ///
    /// # Actions
    /// 1. Write 4 bytes at offset 100 (full 32-byte window at 100).
    /// 2. Write 4 bytes at offset 96.
    ///
    /// # Expected behavior
    /// The old window is flushed once and the new window at 96 holds both
    /// writes in order.
    #[test]
    fn test_adjacent_write_beyond_capacity_repositions() {
        init_tracing();
        let (mut store, ext) = setup(256);
        let mut sieve = SieveBuffer::new(32);

        sieve.write(&mut store, ext, 100, &[1, 1, 1, 1]).unwrap();
        assert_eq!(sieve.window(), Some((100, 32)));

        sieve.write(&mut store, ext, 96, &[2, 2, 2, 2]).unwrap();
        assert_eq!(sieve.window(), Some((96, 32)));
        assert_eq!(store.writes, 1);

        let cached = sieve.cached(96, 8).unwrap();
        assert_eq!(cached, &[2, 2, 2, 2, 1, 1, 1, 1]);
    }

    /// # Scenario
    /// In-place prepend and append when the window is short.
    ///
    /// # Starting environment
    /// 256-byte dataset whose EOA sits 4 bytes past offset 100, so the first
    /// window is only 4 bytes long.
    ///
    /// # Actions
    /// 1. Write 4 bytes at offset 100.
    /// 2. Grow the EOA, write 4 bytes at offset 96 (prepend).
    /// 3. Write 4 bytes at offset 104 (append).
    ///
    /// # Expected behavior
    /// The window is `(96, 12)`, holds all three writes, and no physical
    /// write happened before the explicit flush.
    #[test]
    fn test_prepend_and_append_in_place() {
        init_tracing();
        let mut store = CountingStore::default();
        alloc(&mut store, MemType::Draw, 104).unwrap();
        let ext = Extent { addr: 0, size: 256 };
        let mut sieve = SieveBuffer::new(32);

        sieve.write(&mut store, ext, 100, &[1; 4]).unwrap();
        assert_eq!(sieve.window(), Some((100, 4)));

        store.set_eoa(MemType::Draw, 256).unwrap();
        sieve.write(&mut store, ext, 96, &[2; 4]).unwrap();
        assert_eq!(sieve.window(), Some((96, 8)));
        sieve.write(&mut store, ext, 104, &[3; 4]).unwrap();
        assert_eq!(sieve.window(), Some((96, 12)));
        assert_eq!(store.writes, 0);

        sieve.flush(&mut store).unwrap();
        assert_eq!(store.writes, 1);
        let mut out = [0u8; 12];
        store.read(MemType::Draw, 96, &mut out).unwrap();
        assert_eq!(out, [2, 2, 2, 2, 1, 1, 1, 1, 3, 3, 3, 3]);
    }

    /// # Scenario
    /// A large write overlapping the window invalidates it so stale bytes
    /// cannot shadow the new ones.
    ///
    /// # Starting environment
    /// 256-byte dataset, 16-byte sieve with a clean window at offset 0.
    ///
    /// # Actions
    /// 1. Read 1 byte at offset 0.
    /// 2. Write 64 bytes of 0xEE at offset 0.
    /// 3. Read 1 byte at offset 4.
    ///
    /// # Expected behavior
    /// The window is dropped after step 2 and step 3 returns 0xEE.
    #[test]
    fn test_large_write_invalidates_overlapping_window() {
        init_tracing();
        let (mut store, ext) = setup(256);
        let mut sieve = SieveBuffer::new(16);
        let mut one = [0u8; 1];

        sieve.read(&mut store, ext, 0, &mut one).unwrap();
        sieve.write(&mut store, ext, 0, &[0xEE; 64]).unwrap();
        assert_eq!(sieve.window(), None);

        sieve.read(&mut store, ext, 4, &mut one).unwrap();
        assert_eq!(one, [0xEE]);
    }

    /// # Scenario
    /// A zero-capacity sieve sends every transfer straight to the store.
    ///
    /// # Starting environment
    /// 64-byte dataset, sieve disabled.
    ///
    /// # Actions
    /// 1. Write 1 byte, then read it back.
    ///
    /// # Expected behavior
    /// No buffer is ever allocated.
    #[test]
    fn test_zero_capacity_is_passthrough() {
        init_tracing();
        let (mut store, ext) = setup(64);
        let mut sieve = SieveBuffer::new(0);

        sieve.write(&mut store, ext, 3, &[0x55]).unwrap();
        let mut one = [0u8; 1];
        sieve.read(&mut store, ext, 3, &mut one).unwrap();
        assert_eq!(one, [0x55]);
        assert!(!sieve.is_allocated());
        assert_eq!(store.writes, 1);
    }

    // --------------------------------------------------------------------------------------------
    // Flush failures
    // --------------------------------------------------------------------------------------------

    /// # Scenario
    /// A failing write-back leaves the window dirty.
    ///
    /// # Starting environment
    /// Dirty 8-byte window; the store's EOA is then shrunk below it.
    ///
    /// # Actions
    /// 1. Flush.
    ///
    /// # Expected behavior
    /// The flush fails with `AddressOverflow` and the buffer is still dirty.
    #[test]
    fn test_failed_flush_keeps_dirty_flag() {
        init_tracing();
        let (mut store, ext) = setup(64);
        let mut sieve = SieveBuffer::new(8);

        sieve.write(&mut store, ext, 32, &[9; 4]).unwrap();
        store.set_eoa(MemType::Draw, 16).unwrap();

        let err = sieve.flush(&mut store).unwrap_err();
        assert!(matches!(err, StoreError::AddressOverflow { .. }));
        assert!(sieve.is_dirty());

        store.set_eoa(MemType::Draw, 64).unwrap();
        sieve.release(&mut store).unwrap();
        assert!(!sieve.is_dirty());
        assert!(!sieve.is_allocated());
    }
}
