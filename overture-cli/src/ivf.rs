//! IVF demuxer.

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};

/// Stream-level parameters from the IVF file header.
#[derive(Debug, Clone, Copy)]
pub struct IvfHeader {
    pub width: u16,
    pub height: u16,
    pub timebase_num: u32,
    pub timebase_den: u32,
    pub frame_count: u32,
}

/// Reads AV1 temporal units out of an IVF container.
pub struct IvfReader<R> {
    inner: R,
    pub header: IvfHeader,
}

impl<R: Read> IvfReader<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        inner.read_exact(&mut magic)?;
        if &magic != b"DKIF" {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not an IVF file"));
        }
        let _version = inner.read_u16::<LittleEndian>()?;
        let header_len = inner.read_u16::<LittleEndian>()?;
        let mut fourcc = [0u8; 4];
        inner.read_exact(&mut fourcc)?;
        if &fourcc != b"AV01" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported codec {}", String::from_utf8_lossy(&fourcc)),
            ));
        }
        let width = inner.read_u16::<LittleEndian>()?;
        let height = inner.read_u16::<LittleEndian>()?;
        let timebase_den = inner.read_u32::<LittleEndian>()?;
        let timebase_num = inner.read_u32::<LittleEndian>()?;
        let frame_count = inner.read_u32::<LittleEndian>()?;
        let _unused = inner.read_u32::<LittleEndian>()?;
        // tolerate extended headers
        for _ in 32..header_len {
            inner.read_u8()?;
        }
        Ok(Self {
            inner,
            header: IvfHeader {
                width,
                height,
                timebase_num,
                timebase_den,
                frame_count,
            },
        })
    }

    /// Next temporal unit, or `None` at end of file.
    pub fn read_frame(&mut self) -> io::Result<Option<(u64, Vec<u8>)>> {
        let size = match self.inner.read_u32::<LittleEndian>() {
            Ok(v) => v as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let pts = self.inner.read_u64::<LittleEndian>()?;
        let mut data = vec![0u8; size];
        self.inner.read_exact(&mut data)?;
        Ok(Some((pts, data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    fn write_ivf(frames: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"DKIF");
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(32).unwrap();
        out.extend_from_slice(b"AV01");
        out.write_u16::<LittleEndian>(64).unwrap();
        out.write_u16::<LittleEndian>(64).unwrap();
        out.write_u32::<LittleEndian>(25).unwrap();
        out.write_u32::<LittleEndian>(1).unwrap();
        out.write_u32::<LittleEndian>(frames.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            out.write_u32::<LittleEndian>(frame.len() as u32).unwrap();
            out.write_u64::<LittleEndian>(i as u64).unwrap();
            out.extend_from_slice(frame);
        }
        out
    }

    #[test]
    fn test_roundtrip() {
        let data = write_ivf(&[&[1, 2, 3], &[4, 5]]);
        let mut reader = IvfReader::new(Cursor::new(data)).unwrap();
        assert_eq!(reader.header.width, 64);
        assert_eq!(reader.header.frame_count, 2);
        let (pts, frame) = reader.read_frame().unwrap().unwrap();
        assert_eq!(pts, 0);
        assert_eq!(frame, vec![1, 2, 3]);
        let (_, frame) = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame, vec![4, 5]);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_rejects_other_codecs() {
        let mut data = write_ivf(&[]);
        data[8..12].copy_from_slice(b"VP90");
        assert!(IvfReader::new(Cursor::new(data)).is_err());
    }
}
