use super::{BlockStore, MemType, StoreError, check_range};

/// In-memory block store.
///
/// The image grows on write; its length is the EOF.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    data: Vec<u8>,
    eoa: u64,
}

impl MemStore {
    /// An empty store with EOA 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing image; the EOA is set to its length.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let eoa = data.len() as u64;
        Self { data, eoa }
    }

    /// The bytes physically present.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the store and return its image.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl BlockStore for MemStore {
    fn read(&self, _mem: MemType, addr: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        check_range(addr, buf.len(), self.eoa)?;
        let start = addr as usize;
        let present = self.data.len().saturating_sub(start).min(buf.len());
        if present > 0 {
            buf[..present].copy_from_slice(&self.data[start..start + present]);
        }
        buf[present..].fill(0);
        Ok(())
    }

    fn write(&mut self, _mem: MemType, addr: u64, buf: &[u8]) -> Result<(), StoreError> {
        check_range(addr, buf.len(), self.eoa)?;
        let start = addr as usize;
        let end = start + buf.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn get_eoa(&self, _mem: MemType) -> u64 {
        self.eoa
    }

    fn set_eoa(&mut self, _mem: MemType, addr: u64) -> Result<(), StoreError> {
        self.eoa = addr;
        Ok(())
    }

    fn get_eof(&self, _mem: MemType) -> u64 {
        self.data.len() as u64
    }

    fn truncate(&mut self) -> Result<(), StoreError> {
        let eoa = usize::try_from(self.eoa)
            .map_err(|_| StoreError::Internal(format!("EOA {} exceeds usize", self.eoa)))?;
        self.data.resize(eoa, 0);
        Ok(())
    }
}
