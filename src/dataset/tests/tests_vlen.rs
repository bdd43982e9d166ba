//! Variable-length element tests: sequences stored in the global heap
//! behind dataset references.

#[cfg(test)]
mod tests {
    use crate::dataset::{Container, Dataset};
    use crate::layout::{Dataspace, Datatype, Hyperslab, LayoutError, LayoutSpec, Selection};
    use crate::store::MemStore;
    use crate::StorageConfig;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn setup(n: u64, base_size: usize) -> (Container, Dataset) {
        let mut file = Container::new(Box::new(MemStore::new()), StorageConfig::default()).unwrap();
        let dset = Dataset::create(
            &mut file,
            Dataspace::simple(&[n]),
            Datatype::VarLen { base_size },
            &LayoutSpec::Contiguous,
        )
        .unwrap();
        (file, dset)
    }

    #[test]
    fn test_write_read_sequences() {
        init_tracing();
        let (mut file, mut dset) = setup(3, 1);
        let values: [&[u8]; 3] = [b"alpha", b"", b"gamma ray"];
        dset.write_vl(&mut file, &Selection::All, &values).unwrap();

        let out = dset.read_vl(&mut file, &Selection::All).unwrap();
        assert_eq!(out, vec![b"alpha".to_vec(), Vec::new(), b"gamma ray".to_vec()]);

        let tail = Selection::Block(Hyperslab::new(&[2], &[1]));
        assert_eq!(dset.read_vl(&mut file, &tail).unwrap(), vec![b"gamma ray".to_vec()]);
        assert_eq!(file.heap_mut().cwfs_len(), 1);
    }

    #[test]
    fn test_sequences_survive_heap_flush() {
        init_tracing();
        let (mut file, mut dset) = setup(2, 2);
        dset.write_vl(&mut file, &Selection::All, &[&[1u8, 0, 2, 0][..], &[3, 0][..]]).unwrap();
        dset.flush(&mut file).unwrap();
        file.flush().unwrap();

        let out = dset.read_vl(&mut file, &Selection::All).unwrap();
        assert_eq!(out, vec![vec![1, 0, 2, 0], vec![3, 0]]);
    }

    #[test]
    fn test_partial_base_element_rejected() {
        init_tracing();
        let (mut file, mut dset) = setup(1, 4);
        let err = dset.write_vl(&mut file, &Selection::All, &[&[1u8, 2, 3][..]]).unwrap_err();
        assert!(matches!(err, LayoutError::TypeMismatch(_)));
    }

    #[test]
    fn test_value_count_checked() {
        init_tracing();
        let (mut file, mut dset) = setup(2, 1);
        let err = dset.write_vl(&mut file, &Selection::All, &[&b"x"[..]]).unwrap_err();
        assert!(matches!(err, LayoutError::BufferSize { expected: 2, actual: 1 }));
    }

    #[test]
    fn test_fixed_type_rejected() {
        init_tracing();
        let mut file = Container::new(Box::new(MemStore::new()), StorageConfig::default()).unwrap();
        let mut dset = Dataset::create(
            &mut file,
            Dataspace::simple(&[1]),
            Datatype::le(4),
            &LayoutSpec::Contiguous,
        )
        .unwrap();
        assert!(matches!(
            dset.read_vl(&mut file, &Selection::All),
            Err(LayoutError::TypeMismatch(_))
        ));
    }
}
