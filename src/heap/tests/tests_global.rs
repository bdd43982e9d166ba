//! Global heap tests: collections, CWFS reuse, refcounts and reload.

#[cfg(test)]
mod tests {
    use crate::heap::{GlobalHeap, GlobalHeapId, HeapError, VlRef};
    use crate::store::MemStore;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn test_insert_read_share_one_collection() {
        init_tracing();
        let mut store = MemStore::new();
        let mut heap = GlobalHeap::new(1 << 20, 4096);

        let a = heap.insert(&mut store, b"first object").unwrap();
        let b = heap.insert(&mut store, b"second").unwrap();
        assert_eq!(a.collection, b.collection);
        assert_eq!((a.index, b.index), (1, 2));
        assert_eq!(heap.read(&mut store, a).unwrap(), b"first object");
        assert_eq!(heap.read(&mut store, b).unwrap(), b"second");
        assert_eq!(heap.cwfs_len(), 1);
    }

    /// # Scenario
    /// An object larger than the minimum collection gets its own collection,
    /// sized to fit exactly, which is retired from the CWFS list at once.
    ///
    /// # Starting environment
    /// Empty heap with 64-byte minimum collections.
    ///
    /// # Actions
    /// 1. Insert a 100-byte object.
    ///
    /// # Expected behavior
    /// The collection is 16 + 16 + 104 bytes and the CWFS list is empty.
    #[test]
    fn test_large_object_gets_exact_collection() {
        init_tracing();
        let mut store = MemStore::new();
        let mut heap = GlobalHeap::new(1 << 20, 64);

        let id = heap.insert(&mut store, &[5u8; 100]).unwrap();
        assert_eq!(heap.cwfs_len(), 0);
        heap.flush(&mut store).unwrap();
        assert_eq!(store.as_bytes().len(), 136);
        assert_eq!(heap.read(&mut store, id).unwrap(), vec![5u8; 100]);
    }

    #[test]
    fn test_refcount_and_remove() {
        init_tracing();
        let mut store = MemStore::new();
        let mut heap = GlobalHeap::new(1 << 20, 4096);

        let id = heap.insert(&mut store, b"shared").unwrap();
        assert_eq!(heap.adjust_refcount(&mut store, id, 2).unwrap(), 3);
        assert_eq!(heap.adjust_refcount(&mut store, id, -3).unwrap(), 0);
        assert!(matches!(
            heap.adjust_refcount(&mut store, id, -1),
            Err(HeapError::RefcountOverflow { .. })
        ));

        heap.remove(&mut store, id).unwrap();
        assert!(matches!(
            heap.read(&mut store, id),
            Err(HeapError::ObjectNotFound { .. })
        ));
        let again = heap.insert(&mut store, b"reused").unwrap();
        assert_eq!(again, GlobalHeapId { index: 1, ..id });
    }

    /// # Scenario
    /// Collections written by one heap are readable by another.
    ///
    /// # Starting environment
    /// Heap with three objects, flushed to a `MemStore`.
    ///
    /// # Actions
    /// 1. Create a second heap over the same store.
    /// 2. Read all three objects and adjust one refcount.
    ///
    /// # Expected behavior
    /// Contents and reference counts survive the round trip.
    #[test]
    fn test_reload_from_store() {
        init_tracing();
        let mut store = MemStore::new();
        let mut writer = GlobalHeap::new(1 << 20, 4096);
        let ids: Vec<GlobalHeapId> = [&b"a"[..], &b"bb"[..], &b"a longer object value"[..]]
            .iter()
            .map(|d| writer.insert(&mut store, d).unwrap())
            .collect();
        writer.adjust_refcount(&mut store, ids[1], 4).unwrap();
        writer.flush(&mut store).unwrap();

        let mut reader = GlobalHeap::new(1 << 20, 4096);
        assert_eq!(reader.read(&mut store, ids[0]).unwrap(), b"a");
        assert_eq!(reader.read(&mut store, ids[2]).unwrap(), b"a longer object value");
        assert_eq!(reader.adjust_refcount(&mut store, ids[1], 0).unwrap(), 5);
        assert_eq!(reader.stats().misses, 1);
    }

    #[test]
    fn test_vl_ref_encoding() {
        let r = VlRef {
            len: 3,
            id: GlobalHeapId {
                collection: 0x1122,
                index: 7,
            },
        };
        let raw = r.to_bytes();
        assert_eq!(VlRef::from_bytes(&raw).unwrap(), Some(r));
        assert_eq!(VlRef::from_bytes(&[0u8; 16]).unwrap(), None);
        assert!(VlRef::from_bytes(&[1u8; 4]).is_err());
    }
}
