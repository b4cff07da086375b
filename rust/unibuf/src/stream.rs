//! Size-prefixed byte-stream (de)serialization.
//!
//! Wire format: an 8-byte little-endian logical size followed by exactly
//! that many payload bytes. The payload moves in fixed-size chunks staged
//! through the host backend; the chunk size is an implementation constant,
//! not part of the format.

use unibuf_common::error::Error;
use unibuf_common::{Result, verify_data};
use unibuf_io::{ReadAt, WriteAt};

use crate::buffer::Buffer;

const IO_CHUNK_SIZE: usize = 64 * 1024;

impl Buffer {
    /// Replaces this buffer's size and content from a size-prefixed
    /// stream. The previous content is discarded before the first chunk
    /// lands.
    pub fn read_from(&mut self, reader: &dyn ReadAt) -> Result<()> {
        let mut prefix = [0u8; 8];
        reader
            .read_at(0, &mut prefix)
            .map_err(|e| Error::io("stream size prefix", e))?;
        let size = u64::from_le_bytes(prefix);
        verify_data!(size, usize::try_from(size).is_ok());
        let size = size as usize;
        self.resize_discard(size)?;

        let mut chunk = vec![0u8; IO_CHUNK_SIZE.min(size.max(1))];
        let mut ofs = 0;
        while ofs < size {
            let n = (size - ofs).min(IO_CHUNK_SIZE);
            reader
                .read_at(8 + ofs as u64, &mut chunk[..n])
                .map_err(|e| Error::io("stream payload", e))?;
            self.set_range(ofs, &chunk[..n])?;
            ofs += n;
        }
        Ok(())
    }

    /// Writes the buffer as a size-prefixed stream. The data must already
    /// be valid in the owning backend.
    pub fn write_to(&self, writer: &dyn WriteAt) -> Result<()> {
        let size = self.len();
        writer
            .write_at(0, &(size as u64).to_le_bytes())
            .map_err(|e| Error::io("stream size prefix", e))?;

        let mut chunk = vec![0u8; IO_CHUNK_SIZE.min(size.max(1))];
        let mut ofs = 0;
        while ofs < size {
            let n = (size - ofs).min(IO_CHUNK_SIZE);
            self.get_range(&mut chunk[..n], ofs)?;
            writer
                .write_at(8 + ofs as u64, &chunk[..n])
                .map_err(|e| Error::io("stream payload", e))?;
            ofs += n;
        }
        Ok(())
    }
}
