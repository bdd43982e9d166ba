//! Raw data copy tests: byte-order conversion, batching, sieve hits,
//! variable-length re-homing and reference handling.

#[cfg(test)]
mod tests {
    use crate::StorageConfig;
    use crate::heap::{GlobalHeap, VlRef};
    use crate::layout::copy::{CopySide, copy};
    use crate::layout::{
        Contiguous, CopyOptions, Dataspace, Datatype, IoDirection, IoInfo, LayoutError, LayoutOps,
        Selection,
    };
    use crate::store::MemStore;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// One dataset with its own store and heap.
    struct Side {
        store: MemStore,
        heap: GlobalHeap,
        space: Dataspace,
        dtype: Datatype,
        layout: Contiguous,
    }

    impl Side {
        fn new(n: u64, dtype: Datatype) -> Self {
            let space = Dataspace::simple(&[n]);
            let layout = Contiguous::construct(&space, &dtype, &StorageConfig::default()).unwrap();
            Self {
                store: MemStore::new(),
                heap: GlobalHeap::new(1 << 20, 4096),
                space,
                dtype,
                layout,
            }
        }

        fn write(&mut self, buf: &[u8]) {
            let io = IoInfo::new(
                IoDirection::Write,
                &self.space,
                &self.dtype,
                &Selection::All,
                self.layout.descriptor(),
            );
            self.layout.write(&mut self.store, &io, buf).unwrap();
        }

        fn read(&mut self) -> Vec<u8> {
            let io = IoInfo::new(
                IoDirection::Read,
                &self.space,
                &self.dtype,
                &Selection::All,
                self.layout.descriptor(),
            );
            let mut out = vec![0u8; io.transfer_size() as usize];
            self.layout.read(&mut self.store, &io, &mut out).unwrap();
            out
        }

        fn side(&mut self) -> CopySide<'_> {
            CopySide {
                layout: &mut self.layout,
                store: &mut self.store,
                heap: &mut self.heap,
                dtype: &self.dtype,
            }
        }
    }

    #[test]
    fn test_byte_order_conversion() {
        init_tracing();
        let values: Vec<u32> = vec![1, 0x0102_0304, 0xDEAD_BEEF, 7];
        let mut src = Side::new(4, Datatype::le(4));
        let mut dst = Side::new(4, Datatype::be(4));
        src.write(&values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>());

        let stats = copy(src.side(), dst.side(), 4, &CopyOptions::default()).unwrap();
        assert_eq!(stats.bytes, 16);
        assert_eq!(stats.batches, 1);
        assert_eq!(
            dst.read(),
            values.iter().flat_map(|v| v.to_be_bytes()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_same_order_is_plain_copy() {
        init_tracing();
        let mut src = Side::new(3, Datatype::be(2));
        let mut dst = Side::new(3, Datatype::be(2));
        src.write(&[1, 2, 3, 4, 5, 6]);
        copy(src.side(), dst.side(), 3, &CopyOptions::default()).unwrap();
        assert_eq!(dst.read(), vec![1, 2, 3, 4, 5, 6]);
    }

    /// # Scenario
    /// A conversion buffer smaller than the dataset splits the copy into
    /// batches, each still holding whole elements. The first batch loads the
    /// source sieve window, which then serves the rest.
    ///
    /// # Starting environment
    /// 10 four-byte elements; the source was written, flushed and its
    /// sieve buffer released.
    ///
    /// # Actions
    /// 1. Copy with a 9-byte buffer (two elements per batch).
    ///
    /// # Expected behavior
    /// Five batches, four of them sieve hits, identical destination contents.
    #[test]
    fn test_small_buffer_batches() {
        init_tracing();
        let data: Vec<u8> = (0..40).collect();
        let mut src = Side::new(10, Datatype::le(4));
        let mut dst = Side::new(10, Datatype::le(4));
        src.write(&data);
        src.layout.destroy(&mut src.store).unwrap();
        assert!(src.layout.cached(0, 8).is_none());

        let opts = CopyOptions {
            buf_size: 9,
            ..CopyOptions::default()
        };
        let stats = copy(src.side(), dst.side(), 10, &opts).unwrap();
        assert_eq!(stats.batches, 5);
        assert_eq!(stats.sieve_hits, 4);
        assert_eq!(dst.read(), data);
    }

    #[test]
    fn test_buffer_below_one_element_still_progresses() {
        init_tracing();
        let mut src = Side::new(2, Datatype::le(8));
        let mut dst = Side::new(2, Datatype::le(8));
        src.write(&[3u8; 16]);
        let opts = CopyOptions {
            buf_size: 1,
            ..CopyOptions::default()
        };
        let stats = copy(src.side(), dst.side(), 2, &opts).unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(dst.read(), vec![3u8; 16]);
    }

    #[test]
    fn test_batches_served_from_source_sieve() {
        init_tracing();
        let mut src = Side::new(8, Datatype::le(4));
        let mut dst = Side::new(8, Datatype::le(4));
        src.write(&[0xAB; 32]);
        assert!(src.layout.sieve().is_dirty());

        let stats = copy(src.side(), dst.side(), 8, &CopyOptions::default()).unwrap();
        assert_eq!(stats.sieve_hits, 1);
        assert_eq!(dst.read(), vec![0xAB; 32]);
    }

    /// # Scenario
    /// Variable-length elements point into the source file's global heap;
    /// after the copy each must point at an equal sequence in the
    /// destination heap.
    ///
    /// # Starting environment
    /// Two stores, each with its own heap. The source holds two elements:
    /// one sequence and one null element.
    ///
    /// # Actions
    /// 1. Copy both elements.
    /// 2. Decode the destination elements and read their heap objects.
    ///
    /// # Expected behavior
    /// One sequence re-homed with the original bytes; the null element
    /// stays null.
    #[test]
    fn test_variable_length_rehomed() {
        init_tracing();
        let dtype = Datatype::VarLen { base_size: 1 };
        let mut src = Side::new(2, dtype);
        let mut dst = Side::new(2, dtype);

        let id = src.heap.insert(&mut src.store, b"hello").unwrap();
        let mut elems = VlRef { len: 5, id }.to_bytes().to_vec();
        elems.extend_from_slice(&[0u8; 16]);
        src.write(&elems);

        let stats = copy(src.side(), dst.side(), 2, &CopyOptions::default()).unwrap();
        assert_eq!(stats.vl_rehomed, 1);

        let out = dst.read();
        let copied = VlRef::from_bytes(&out[..16]).unwrap().unwrap();
        assert_eq!(copied.len, 5);
        assert_eq!(dst.heap.read(&mut dst.store, copied.id).unwrap(), b"hello");
        assert_eq!(VlRef::from_bytes(&out[16..]).unwrap(), None);
    }

    #[test]
    fn test_references_zeroed_unless_expanded() {
        init_tracing();
        let refs = [0x11u8; 16];

        let mut src = Side::new(2, Datatype::Reference);
        let mut dst = Side::new(2, Datatype::Reference);
        src.write(&refs);
        copy(src.side(), dst.side(), 2, &CopyOptions::default()).unwrap();
        assert_eq!(dst.read(), vec![0u8; 16]);

        let mut kept = Side::new(2, Datatype::Reference);
        let opts = CopyOptions {
            expand_references: true,
            ..CopyOptions::default()
        };
        copy(src.side(), kept.side(), 2, &opts).unwrap();
        assert_eq!(kept.read(), refs.to_vec());
    }

    #[test]
    fn test_incompatible_types_rejected() {
        init_tracing();
        let mut src = Side::new(2, Datatype::le(4));
        let mut dst = Side::new(2, Datatype::le(8));
        let err = copy(src.side(), dst.side(), 2, &CopyOptions::default()).unwrap_err();
        assert!(matches!(err, LayoutError::TypeMismatch(_)));

        let mut vl = Side::new(2, Datatype::VarLen { base_size: 4 });
        let err = copy(src.side(), vl.side(), 2, &CopyOptions::default()).unwrap_err();
        assert!(matches!(err, LayoutError::TypeMismatch(_)));
    }

    #[test]
    fn test_zero_elements_is_noop() {
        init_tracing();
        let mut src = Side::new(2, Datatype::le(4));
        let mut dst = Side::new(2, Datatype::le(4));
        let stats = copy(src.side(), dst.side(), 0, &CopyOptions::default()).unwrap();
        assert_eq!(stats.batches, 0);
        assert!(!dst.layout.is_space_allocated());
    }
}
