//! Output muxers: Y4M, raw YUV and MD5.

use std::io::{self, Write};

use md5::{Digest, Md5};
use overture_av1::{Picture, PixelLayout};

/// Sink for decoded pictures.
pub trait Muxer {
    fn write_picture(&mut self, picture: &Picture) -> io::Result<()>;
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Pick a muxer by explicit name or output extension.
pub fn by_name(name: &str, out: Box<dyn Write>) -> Option<Box<dyn Muxer>> {
    match name {
        "y4m" | "y4m2" => Some(Box::new(Y4mMuxer::new(out))),
        "yuv" => Some(Box::new(YuvMuxer::new(out))),
        "md5" => Some(Box::new(Md5Muxer::new(out))),
        "null" => Some(Box::new(NullMuxer)),
        _ => None,
    }
}

fn visible_plane_rows<'a>(
    picture: &'a Picture,
    pl: usize,
) -> impl Iterator<Item = impl std::ops::Deref<Target = [u8]> + 'a> + 'a {
    let layout = picture.params.layout;
    let (ss_hor, ss_ver) = if pl == 0 {
        (0, 0)
    } else {
        (layout.ss_hor(), layout.ss_ver())
    };
    let bytes = 1 + (picture.params.bpc > 8) as usize;
    let w = ((picture.params.w as usize + (1 << ss_hor) - 1) >> ss_hor) * bytes;
    let h = (picture.params.h as usize + (1 << ss_ver) - 1) >> ss_ver;
    let stride = picture.stride(pl);
    (0..h).map(move |y| {
        let cell = picture.plane_cell(pl);
        cell.slice(y * stride..y * stride + w)
    })
}

/// YUV4MPEG2 writer.
pub struct Y4mMuxer {
    out: Box<dyn Write>,
    wrote_header: bool,
}

impl Y4mMuxer {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            out,
            wrote_header: false,
        }
    }
}

impl Muxer for Y4mMuxer {
    fn write_picture(&mut self, picture: &Picture) -> io::Result<()> {
        if !self.wrote_header {
            let colorspace = match (picture.params.layout, picture.params.bpc) {
                (PixelLayout::I400, _) => "Cmono".to_string(),
                (PixelLayout::I420, 8) => "C420jpeg".to_string(),
                (PixelLayout::I420, bpc) => format!("C420p{bpc}"),
                (PixelLayout::I422, 8) => "C422".to_string(),
                (PixelLayout::I422, bpc) => format!("C422p{bpc}"),
                (PixelLayout::I444, 8) => "C444".to_string(),
                (PixelLayout::I444, bpc) => format!("C444p{bpc}"),
            };
            writeln!(
                self.out,
                "YUV4MPEG2 W{} H{} F25:1 Ip A0:0 {colorspace}",
                picture.params.w, picture.params.h
            )?;
            self.wrote_header = true;
        }
        writeln!(self.out, "FRAME")?;
        for pl in 0..picture.num_planes() {
            for row in visible_plane_rows(picture, pl) {
                self.out.write_all(&row)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Headerless planar writer.
pub struct YuvMuxer {
    out: Box<dyn Write>,
}

impl YuvMuxer {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self { out }
    }
}

impl Muxer for YuvMuxer {
    fn write_picture(&mut self, picture: &Picture) -> io::Result<()> {
        for pl in 0..picture.num_planes() {
            for row in visible_plane_rows(picture, pl) {
                self.out.write_all(&row)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Digest writer: one MD5 over every visible sample, hex on finish.
pub struct Md5Muxer {
    out: Box<dyn Write>,
    hash: Md5,
}

impl Md5Muxer {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            out,
            hash: Md5::new(),
        }
    }
}

impl Muxer for Md5Muxer {
    fn write_picture(&mut self, picture: &Picture) -> io::Result<()> {
        for pl in 0..picture.num_planes() {
            for row in visible_plane_rows(picture, pl) {
                self.hash.update(&*row);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        let digest = self.hash.clone().finalize();
        for byte in digest {
            write!(self.out, "{byte:02x}")?;
        }
        writeln!(self.out)?;
        self.out.flush()
    }
}

/// Discards everything; useful for benchmarking.
pub struct NullMuxer;

impl Muxer for NullMuxer {
    fn write_picture(&mut self, _picture: &Picture) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_name() {
        assert!(by_name("y4m", Box::new(Vec::<u8>::new())).is_some());
        assert!(by_name("md5", Box::new(Vec::<u8>::new())).is_some());
        assert!(by_name("wav", Box::new(Vec::<u8>::new())).is_none());
    }
}
