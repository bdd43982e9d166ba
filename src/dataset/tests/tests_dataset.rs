//! Dataset lifecycle tests over every layout: create, write, read back,
//! flush, close and reopen.

#[cfg(test)]
mod tests {
    use crate::dataset::{Container, Dataset};
    use crate::layout::{
        Dataspace, Datatype, Hyperslab, LayoutError, LayoutKind, LayoutSpec, Selection,
        StorageDescriptor,
    };
    use crate::store::{FileStore, MemStore};
    use crate::{Error, StorageConfig};
    use tempfile::TempDir;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn mem_container() -> Container {
        Container::new(Box::new(MemStore::new()), StorageConfig::default()).unwrap()
    }

    fn all_layouts() -> Vec<LayoutSpec> {
        vec![
            LayoutSpec::Compact,
            LayoutSpec::Contiguous,
            LayoutSpec::Chunked {
                chunk_dims: vec![3, 2],
                filtered: false,
            },
        ]
    }

    #[test]
    fn test_invalid_config_rejected() {
        init_tracing();
        let config = StorageConfig {
            max_compact_size: 4,
            ..StorageConfig::default()
        };
        let err = Container::new(Box::new(MemStore::new()), config).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let config = StorageConfig {
            metadata_cache_bytes: 100,
            ..StorageConfig::default()
        };
        assert!(Container::new(Box::new(MemStore::new()), config).is_err());
    }

    /// # Scenario
    /// Every layout stores the same data and serves the same block reads.
    ///
    /// # Starting environment
    /// A 5x4 dataset of 2-byte elements per layout, in one memory container.
    ///
    /// # Actions
    /// 1. Write the whole dataset.
    /// 2. Overwrite a 2x2 block.
    /// 3. Read the whole dataset and a 3x3 block.
    ///
    /// # Expected behavior
    /// All layouts return identical bytes matching a plain in-memory model.
    #[test]
    fn test_layouts_agree() {
        init_tracing();
        let mut file = mem_container();
        let dims = [5u64, 4];
        let full: Vec<u8> = (0..40).collect();

        let mut model = full.clone();
        let patch_sel = Selection::Block(Hyperslab::new(&[2, 1], &[2, 2]));
        let patch = [100u8, 101, 102, 103, 104, 105, 106, 107];
        for (i, row) in [2usize, 3].iter().enumerate() {
            let start = (row * 4 + 1) * 2;
            model[start..start + 4].copy_from_slice(&patch[i * 4..i * 4 + 4]);
        }

        for spec in all_layouts() {
            let mut dset =
                Dataset::create(&mut file, Dataspace::simple(&dims), Datatype::le(2), &spec).unwrap();
            dset.write(&mut file, &Selection::All, &full).unwrap();
            dset.write(&mut file, &patch_sel, &patch).unwrap();

            let mut out = vec![0u8; 40];
            dset.read(&mut file, &Selection::All, &mut out).unwrap();
            assert_eq!(out, model, "{spec:?}");

            let block = Selection::Block(Hyperslab::new(&[1, 1], &[3, 3]));
            let mut out = vec![0u8; 18];
            dset.read(&mut file, &block, &mut out).unwrap();
            let mut expected = Vec::new();
            for row in 1..4usize {
                let start = (row * 4 + 1) * 2;
                expected.extend_from_slice(&model[start..start + 6]);
            }
            assert_eq!(out, expected, "{spec:?}");

            dset.close(&mut file).unwrap();
        }
    }

    #[test]
    fn test_compact_allocated_at_create() {
        init_tracing();
        let mut file = mem_container();
        let dset = Dataset::create(
            &mut file,
            Dataspace::simple(&[4]),
            Datatype::le(4),
            &LayoutSpec::Compact,
        )
        .unwrap();
        assert_eq!(dset.kind(), LayoutKind::Compact);
        assert_eq!(
            dset.descriptor(),
            StorageDescriptor::Compact {
                header_addr: Some(0),
                size: 16
            }
        );
    }

    #[test]
    fn test_selection_outside_extent_rejected() {
        init_tracing();
        let mut file = mem_container();
        let mut dset = Dataset::create(
            &mut file,
            Dataspace::simple(&[4]),
            Datatype::le(1),
            &LayoutSpec::Contiguous,
        )
        .unwrap();
        let sel = Selection::Block(Hyperslab::new(&[3], &[2]));
        let err = dset.write(&mut file, &sel, &[1, 2]).unwrap_err();
        assert!(matches!(err, LayoutError::Selection(_)));
    }

    #[test]
    fn test_null_space_transfers_nothing() {
        init_tracing();
        let mut file = mem_container();
        let mut dset = Dataset::create(
            &mut file,
            Dataspace::null(),
            Datatype::le(4),
            &LayoutSpec::Contiguous,
        )
        .unwrap();
        assert_eq!(dset.write(&mut file, &Selection::None, &[]).unwrap(), 0);
        assert!(matches!(
            dset.write(&mut file, &Selection::All, &[]),
            Err(LayoutError::Selection(_))
        ));
    }

    /// # Scenario
    /// Contiguous and compact raw data survive closing the file and
    /// reopening it from disk through the storage descriptors.
    ///
    /// # Starting environment
    /// A file-backed container in a temporary directory.
    ///
    /// # Actions
    /// 1. Create one compact and one contiguous dataset and write both.
    /// 2. Close the datasets, flush and drop the container.
    /// 3. Reopen the file and both datasets from their descriptors.
    ///
    /// # Expected behavior
    /// Both datasets read back what was written.
    #[test]
    fn test_reopen_from_file() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.bin");

        let (compact_desc, contig_desc) = {
            let store = FileStore::create(&path).unwrap();
            let mut file = Container::new(Box::new(store), StorageConfig::default()).unwrap();

            let mut compact = Dataset::create(
                &mut file,
                Dataspace::simple(&[3]),
                Datatype::le(1),
                &LayoutSpec::Compact,
            )
            .unwrap();
            compact.write(&mut file, &Selection::All, &[7, 8, 9]).unwrap();

            let mut contig = Dataset::create(
                &mut file,
                Dataspace::simple(&[2, 2]),
                Datatype::be(2),
                &LayoutSpec::Contiguous,
            )
            .unwrap();
            contig.write(&mut file, &Selection::All, &[0, 1, 0, 2, 0, 3, 0, 4]).unwrap();

            let descs = (compact.descriptor(), contig.descriptor());
            compact.close(&mut file).unwrap();
            contig.close(&mut file).unwrap();
            file.into_store().unwrap();
            descs
        };

        let store = FileStore::open(&path, false).unwrap();
        let mut file = Container::new(Box::new(store), StorageConfig::default()).unwrap();

        let mut compact =
            Dataset::open(&mut file, Dataspace::simple(&[3]), Datatype::le(1), &compact_desc).unwrap();
        let mut out = [0u8; 3];
        compact.read(&mut file, &Selection::All, &mut out).unwrap();
        assert_eq!(out, [7, 8, 9]);

        let mut contig =
            Dataset::open(&mut file, Dataspace::simple(&[2, 2]), Datatype::be(2), &contig_desc).unwrap();
        let mut out = [0u8; 8];
        contig.read(&mut file, &Selection::All, &mut out).unwrap();
        assert_eq!(out, [0, 1, 0, 2, 0, 3, 0, 4]);
    }

    #[test]
    fn test_chunked_cannot_reopen() {
        init_tracing();
        let mut file = mem_container();
        let desc = StorageDescriptor::Chunked {
            chunk_dims: vec![2],
            chunk_size: 2,
            nchunks: 2,
            allocated: 2,
            filtered: false,
        };
        let err = Dataset::open(&mut file, Dataspace::simple(&[4]), Datatype::le(1), &desc).unwrap_err();
        assert!(matches!(err, LayoutError::UnsupportedLayout(_)));
    }
}
