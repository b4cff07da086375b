use std::sync::{Arc, Mutex};

use crate::{ReadAt, WriteAt};

/// An in-memory byte stream implementing both [`ReadAt`] and [`WriteAt`].
///
/// Cloning is cheap and shares the underlying storage. Writes past the
/// current end zero-fill the gap, mirroring sparse file semantics.
#[derive(Clone, Default)]
pub struct MemoryStream {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStream {
    pub fn new() -> MemoryStream {
        Default::default()
    }

    pub fn from_vec(data: Vec<u8>) -> MemoryStream {
        MemoryStream {
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// Returns a copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().expect("lock").clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().expect("lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReadAt for MemoryStream {
    fn size(&self) -> std::io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_at(&self, pos: u64, dst: &mut [u8]) -> std::io::Result<()> {
        let data = self.data.lock().expect("lock");
        let pos = usize::try_from(pos)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        let end = pos
            .checked_add(dst.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        dst.copy_from_slice(&data[pos..end]);
        Ok(())
    }
}

impl WriteAt for MemoryStream {
    fn write_at(&self, pos: u64, src: &[u8]) -> std::io::Result<()> {
        let mut data = self.data.lock().expect("lock");
        let pos = usize::try_from(pos)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "position"))?;
        let end = pos
            .checked_add(src.len())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "range"))?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[pos..end].copy_from_slice(src);
        Ok(())
    }
}

impl ReadAt for Vec<u8> {
    fn size(&self) -> std::io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_at(&self, pos: u64, dst: &mut [u8]) -> std::io::Result<()> {
        let pos = usize::try_from(pos)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        let end = pos
            .checked_add(dst.len())
            .filter(|&end| end <= self.len())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        dst.copy_from_slice(&self[pos..end]);
        Ok(())
    }
}
