//! Compact layout tests: the message size bound and the flush/open cycle.

#[cfg(test)]
mod tests {
    use crate::StorageConfig;
    use crate::layout::{
        COMPACT_OVERHEAD, Compact, Dataspace, Datatype, IoDirection, IoInfo, LayoutError,
        LayoutOps, Selection,
    };
    use crate::store::MemStore;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn config(max_compact_size: u64) -> StorageConfig {
        StorageConfig {
            max_compact_size,
            ..StorageConfig::default()
        }
    }

    /// # Scenario
    /// Construction succeeds exactly when the payload fits the metadata
    /// message limit minus the layout overhead.
    ///
    /// # Starting environment
    /// A 64-byte compact limit and 4-byte elements.
    ///
    /// # Actions
    /// 1. Construct datasets of 0 through 20 elements.
    ///
    /// # Expected behavior
    /// Up to 15 elements (60 bytes) succeed; 16 and above fail with
    /// `SizeTooLarge { max: 60 }`.
    #[test]
    fn test_size_bound_is_exact() {
        init_tracing();
        let cfg = config(64);
        let dtype = Datatype::le(4);
        let max = 64 - COMPACT_OVERHEAD;

        for n in 0..=20u64 {
            let space = Dataspace::simple(&[n]);
            let result = Compact::construct(&space, &dtype, &cfg);
            if n * 4 <= max {
                assert_eq!(result.unwrap().size(), n * 4);
            } else {
                match result {
                    Err(LayoutError::SizeTooLarge { size, max: m }) => {
                        assert_eq!(size, n * 4);
                        assert_eq!(m, max);
                    }
                    other => panic!("expected SizeTooLarge for {n} elements, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn test_extendible_rejected() {
        init_tracing();
        let space = Dataspace::extendible(&[2], &[None]).unwrap();
        let result = Compact::construct(&space, &Datatype::le(4), &StorageConfig::default());
        assert!(matches!(result, Err(LayoutError::UnsupportedLayout(_))));
    }

    #[test]
    fn test_write_flush_open() {
        init_tracing();
        let mut store = MemStore::new();
        let space = Dataspace::simple(&[4]);
        let dtype = Datatype::le(2);
        let mut layout = Compact::construct(&space, &dtype, &StorageConfig::default()).unwrap();
        layout.allocate(&mut store).unwrap();

        let io = IoInfo::new(IoDirection::Write, &space, &dtype, &Selection::All, layout.descriptor());
        layout.write(&mut store, &io, &[1, 0, 2, 0, 3, 0, 4, 0]).unwrap();
        assert!(layout.is_dirty());
        assert_eq!(store.as_bytes().len(), 0);

        layout.flush(&mut store).unwrap();
        assert!(!layout.is_dirty());
        assert_eq!(store.as_bytes(), &[1, 0, 2, 0, 3, 0, 4, 0]);

        let mut reopened = Compact::open(&store, 0, 8).unwrap();
        let io = IoInfo::new(IoDirection::Read, &space, &dtype, &Selection::All, reopened.descriptor());
        let mut out = [0u8; 8];
        reopened.read(&mut store, &io, &mut out).unwrap();
        assert_eq!(out, [1, 0, 2, 0, 3, 0, 4, 0]);
    }

    #[test]
    fn test_flush_without_header_region_fails() {
        init_tracing();
        let mut store = MemStore::new();
        let space = Dataspace::simple(&[2]);
        let dtype = Datatype::le(1);
        let mut layout = Compact::construct(&space, &dtype, &StorageConfig::default()).unwrap();

        let io = IoInfo::new(IoDirection::Write, &space, &dtype, &Selection::All, layout.descriptor());
        layout.write(&mut store, &io, &[7, 8]).unwrap();
        assert!(matches!(layout.flush(&mut store), Err(LayoutError::Internal(_))));
    }

    #[test]
    fn test_cached_serves_payload() {
        init_tracing();
        let mut store = MemStore::new();
        let space = Dataspace::simple(&[4]);
        let dtype = Datatype::le(1);
        let mut layout = Compact::construct(&space, &dtype, &StorageConfig::default()).unwrap();

        let io = IoInfo::new(IoDirection::Write, &space, &dtype, &Selection::All, layout.descriptor());
        layout.write(&mut store, &io, &[1, 2, 3, 4]).unwrap();
        assert_eq!(layout.cached(1, 2), Some(&[2u8, 3][..]));
        assert_eq!(layout.cached(3, 2), None);
    }
}
