use std::fs::File;

use crate::{ReadAt, WriteAt};

impl ReadAt for File {
    fn size(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn read_at(&self, pos: u64, dst: &mut [u8]) -> std::io::Result<()> {
        file_read_at_exact(self, pos, dst)
    }
}

impl WriteAt for File {
    fn write_at(&self, pos: u64, src: &[u8]) -> std::io::Result<()> {
        file_write_at(self, pos, src)
    }
}

#[cfg(unix)]
pub fn file_read_at_exact(file: &File, pos: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;

    file.read_exact_at(buf, pos)?;
    Ok(())
}

#[cfg(unix)]
pub fn file_write_at(file: &File, pos: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;

    file.write_all_at(buf, pos)
}

#[cfg(windows)]
pub fn file_read_at_exact(file: &File, mut pos: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, pos) {
            Ok(0) => break,
            Ok(n) => {
                buf = &mut buf[n..];
                pos += n as u64;
            }
            Err(e) => return Err(e),
        }
    }
    if !buf.is_empty() {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

#[cfg(windows)]
pub fn file_write_at(file: &File, mut pos: u64, mut buf: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_write(buf, pos) {
            Ok(n) => {
                buf = &buf[n..];
                pos += n as u64;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{ReadAt, WriteAt};

    #[test]
    fn test_file_read_write_at() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("test.bin");
        let file = std::fs::File::create_new(&path).expect("create file");
        for i in 0..10u64 {
            file.write_at(i * 8, b"abcdefgh").expect("write_at");
        }

        let file = std::fs::File::open(&path).expect("open file");
        assert_eq!(file.size().expect("size"), 80);
        let mut buf = [0u8; 4];
        for pos in (0..80).step_by(8) {
            file.read_at(pos, &mut buf).expect("read_at");
            assert_eq!(&buf, b"abcd");
        }
    }

    #[test]
    fn test_file_short_read_is_error() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("short.bin");
        let file = std::fs::File::create_new(&path).expect("create file");
        file.write_at(0, b"xyz").expect("write_at");

        let file = std::fs::File::open(&path).expect("open file");
        let mut buf = [0u8; 8];
        assert!(file.read_at(0, &mut buf).is_err());
    }
}
