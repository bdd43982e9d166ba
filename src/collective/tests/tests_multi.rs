//! Multi-chunk tests: per-chunk mode decisions and mixed transfers.

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::StorageConfig;
    use crate::collective::{
        self, ActualChunkOptMode, ActualIoMode, ChunkOptMode, CollectiveConfig, DebugFlags,
        MpioFile, SharedStore, Transfer, shared_store,
    };
    use crate::comm::ThreadComm;
    use crate::dataset::Dataset;
    use crate::layout::{Dataspace, Datatype, Hyperslab, LayoutSpec, Selection};
    use crate::store::{BlockStore, MemStore, MemType};
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// A 4x4 dataset of 1-byte elements in four 2x2 chunks.
    fn chunked() -> Dataset {
        Dataset::new(
            Dataspace::simple(&[4, 4]),
            Datatype::le(1),
            &LayoutSpec::Chunked {
                chunk_dims: vec![2, 2],
                filtered: false,
            },
            &StorageConfig::default(),
        )
        .unwrap()
    }

    fn value(r: u64, c: u64) -> u8 {
        (r * 4 + c + 1) as u8
    }

    fn block(start: [u64; 2], count: [u64; 2]) -> (Selection, Vec<u8>) {
        let mut buf = Vec::new();
        for r in start[0]..start[0] + count[0] {
            for c in start[1]..start[1] + count[1] {
                buf.push(value(r, c));
            }
        }
        (Selection::Block(Hyperslab::new(&start, &count)), buf)
    }

    fn multi(ratio: u32) -> CollectiveConfig {
        CollectiveConfig {
            chunk_opt_mode: ChunkOptMode::MultiChunk,
            multi_chunk_ratio: ratio,
            debug: DebugFlags::CHUNKS | DebugFlags::TRACE,
            ..CollectiveConfig::default()
        }
    }

    /// Chunk `i` of the 4x4 dataset holds its 2x2 block in row-major order.
    fn chunk_bytes(image: &[u8], i: usize) -> &[u8] {
        &image[i * 4..i * 4 + 4]
    }

    fn expected_chunk(i: u64) -> Vec<u8> {
        let (r0, c0) = ((i / 2) * 2, (i % 2) * 2);
        vec![value(r0, c0), value(r0, c0 + 1), value(r0 + 1, c0), value(r0 + 1, c0 + 1)]
    }

    fn run<T, F>(size: usize, store: SharedStore, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(&mut MpioFile<ThreadComm>) -> T + Send + Sync + Copy + 'static,
    {
        let handles: Vec<_> = ThreadComm::group(size)
            .into_iter()
            .map(|comm| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut file = MpioFile::open(comm, store).unwrap();
                    let out = f(&mut file);
                    file.close().unwrap();
                    out
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn image(store: &SharedStore) -> Vec<u8> {
        let store = store.lock().unwrap();
        let mut buf = vec![0u8; store.get_eoa(MemType::Draw) as usize];
        store.read(MemType::Draw, 0, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_zero_ratio_makes_every_chunk_collective() {
        init_tracing();
        let store = shared_store(MemStore::new());
        let out = run(2, store.clone(), |file| {
            let mut dset = chunked();
            let (sel, buf) = block([2 * file.rank() as u64, 0], [2, 4]);
            let xfer = Transfer::new(&sel, Datatype::le(1));
            collective::write(file, &mut dset, &xfer, &buf, &multi(0)).unwrap()
        });
        for report in &out {
            assert_eq!(report.chunk_opt, ActualChunkOptMode::MultiChunk);
            assert_eq!(report.io_mode, ActualIoMode::ChunkCollective);
            assert!(!report.addr_bcast);
            assert_eq!(report.bytes, 8);
        }
        let image = image(&store);
        for i in 0..4 {
            assert_eq!(chunk_bytes(&image, i), expected_chunk(i as u64).as_slice(), "chunk {i}");
        }
    }

    /// # Scenario
    /// A chunk selected by both ranks goes collective while chunks
    /// selected by one rank go independent, so each rank mixes modes.
    ///
    /// # Starting environment
    /// Two ranks, ratio 60 (a chunk needs more than one rank to go
    /// collective). Rank 0 selects the top two rows (chunks 0, 1); rank 1
    /// the left two columns (chunks 0, 2). Overlapping elements carry the
    /// same values on both ranks.
    ///
    /// # Actions
    /// 1. Multi-chunk collective write.
    /// 2. Multi-chunk collective read of each rank's selection.
    ///
    /// # Expected behavior
    /// Both ranks report mixed I/O; chunks 0 to 2 hold the model and
    /// chunk 3 stays zero; both reads return what was written.
    #[test]
    fn test_mixed_modes() {
        init_tracing();
        let store = shared_store(MemStore::new());
        let out = run(2, store.clone(), |file| {
            let mut dset = chunked();
            let (sel, buf) = if file.rank() == 0 {
                block([0, 0], [2, 4])
            } else {
                block([0, 0], [4, 2])
            };
            let xfer = Transfer::new(&sel, Datatype::le(1));
            let write = collective::write(file, &mut dset, &xfer, &buf, &multi(60)).unwrap();

            let mut back = vec![0u8; buf.len()];
            let read = collective::read(file, &mut dset, &xfer, &mut back, &multi(60)).unwrap();
            (write, read, back == buf)
        });
        for (write, read, same) in &out {
            assert_eq!(write.io_mode, ActualIoMode::ChunkMixed);
            assert!(write.addr_bcast);
            assert_eq!(write.bytes, 8);
            assert_eq!(read.io_mode, ActualIoMode::ChunkMixed);
            assert!(same);
        }
        let image = image(&store);
        for i in 0..3 {
            assert_eq!(chunk_bytes(&image, i), expected_chunk(i as u64).as_slice(), "chunk {i}");
        }
        assert_eq!(chunk_bytes(&image, 3), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_disjoint_chunks_go_independent() {
        init_tracing();
        let store = shared_store(MemStore::new());
        let out = run(2, store.clone(), |file| {
            let mut dset = chunked();
            let (sel, buf) = block([2 * file.rank() as u64, 0], [2, 4]);
            let xfer = Transfer::new(&sel, Datatype::le(1));
            let report = collective::write(file, &mut dset, &xfer, &buf, &multi(60)).unwrap();
            (report.io_mode, file.transfer_mode())
        });
        for (mode, restored) in out {
            assert_eq!(mode, ActualIoMode::ChunkIndependent);
            assert_eq!(restored, collective::TransferMode::Collective);
        }
        let image = image(&store);
        for i in 0..4 {
            assert_eq!(chunk_bytes(&image, i), expected_chunk(i as u64).as_slice(), "chunk {i}");
        }
    }
}
