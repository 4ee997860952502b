//! RMS-compatible binary block file format (C4).
//!
//! Fixed layout: nine little-endian 32-bit header fields, followed by four
//! contiguous `width * height` byte planes (max, max-frame, average, standard
//! deviation). Every integer field is little-endian; the version marker is the
//! two's-complement encoding of -1.

use std::io::{self, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};

/// Size in bytes of the fixed header preceding the four planes.
pub const HEADER_LEN: usize = 36;

/// The nine-field RMS header record. Built once per engine from configuration,
/// then specialised per block by overwriting the fields derived from the
/// block's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorHeader {
    pub nrows: u32,
    pub ncols: u32,
    pub nframes: u32,
    pub first: u32,
    pub camno: u32,
    pub decimation: u32,
    pub interleave: u32,
    pub fps_milli: u32,
}

impl DetectorHeader {
    /// Build the template header shared by every block this engine publishes.
    /// `fps` is rounded to the nearest millihertz-of-a-frame per §6.
    pub fn template(width: u32, height: u32, camno: u32, fps: f64) -> Self {
        Self {
            nrows: height,
            ncols: width,
            nframes: 256,
            first: 0,
            camno,
            decimation: 1,
            interleave: 0,
            fps_milli: (fps * 1000.0).round() as u32,
        }
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&(-1i32).to_le_bytes())?;
        w.write_all(&self.nrows.to_le_bytes())?;
        w.write_all(&self.ncols.to_le_bytes())?;
        w.write_all(&self.nframes.to_le_bytes())?;
        w.write_all(&self.first.to_le_bytes())?;
        w.write_all(&self.camno.to_le_bytes())?;
        w.write_all(&self.decimation.to_le_bytes())?;
        w.write_all(&self.interleave.to_le_bytes())?;
        w.write_all(&self.fps_milli.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; HEADER_LEN];
        r.read_exact(&mut buf)?;
        let version = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        if version != -1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected version marker {version}, expected -1"),
            ));
        }
        Ok(Self {
            nrows: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            ncols: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            nframes: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            first: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            camno: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            decimation: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            interleave: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            fps_milli: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        })
    }
}

/// Write the fixed RMS block-file layout: header, then the four planes in
/// max/max-frame/average/std order. Each plane must be exactly `width*height`
/// bytes.
pub fn write_block_file(
    path: &Path,
    header: &DetectorHeader,
    max_plane: &[u8],
    maxf_plane: &[u8],
    avg_plane: &[u8],
    std_plane: &[u8],
) -> io::Result<()> {
    let expected = (header.nrows * header.ncols) as usize;
    for (name, plane) in [
        ("max", max_plane),
        ("max_frame", maxf_plane),
        ("avg", avg_plane),
        ("std", std_plane),
    ] {
        if plane.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{name} plane has {} bytes, expected {expected}", plane.len()),
            ));
        }
    }

    let mut file = std::fs::File::create(path)?;
    header.write_to(&mut file)?;
    file.write_all(max_plane)?;
    file.write_all(maxf_plane)?;
    file.write_all(avg_plane)?;
    file.write_all(std_plane)?;
    file.flush()
}

/// Read back a block file written by [`write_block_file`]. Used by the binary
/// round-trip tests; the live engine never reads its own output.
pub fn read_block_file(path: &Path) -> io::Result<(DetectorHeader, Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut file = std::fs::File::open(path)?;
    let header = DetectorHeader::read_from(&mut file)?;
    let plane_len = (header.nrows * header.ncols) as usize;

    let mut max_plane = vec![0u8; plane_len];
    let mut maxf_plane = vec![0u8; plane_len];
    let mut avg_plane = vec![0u8; plane_len];
    let mut std_plane = vec![0u8; plane_len];
    file.read_exact(&mut max_plane)?;
    file.read_exact(&mut maxf_plane)?;
    file.read_exact(&mut avg_plane)?;
    file.read_exact(&mut std_plane)?;

    Ok((header, max_plane, maxf_plane, avg_plane, std_plane))
}

/// Build the canonical `FF_<station>_<YYYYMMDD>_<HHMMSS>_<mmm>_000000.bin`
/// filename from a block's completion timestamp, converted to UTC.
pub fn canonical_filename(station: &str, timestamp_ms: u64) -> String {
    let secs = (timestamp_ms / 1000) as i64;
    let millis = (timestamp_ms % 1000) as u32;
    let dt: DateTime<Utc> = DateTime::from_timestamp(secs, millis * 1_000_000)
        .unwrap_or_else(|| DateTime::from_timestamp(0, 0).expect("epoch is always valid"));

    format!(
        "FF_{}_{}_{}_{:03}_000000.bin",
        station,
        dt.format("%Y%m%d"),
        dt.format("%H%M%S"),
        millis,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip_header_and_planes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");

        let header = DetectorHeader::template(4, 3, 7, 25.0);
        let max_plane = vec![10u8; 12];
        let maxf_plane = vec![20u8; 12];
        let avg_plane = vec![5u8; 12];
        let std_plane = vec![1u8; 12];

        write_block_file(&path, &header, &max_plane, &maxf_plane, &avg_plane, &std_plane).unwrap();

        let (read_header, rmax, rmaxf, ravg, rstd) = read_block_file(&path).unwrap();
        assert_eq!(read_header, header);
        assert_eq!(rmax, max_plane);
        assert_eq!(rmaxf, maxf_plane);
        assert_eq!(ravg, avg_plane);
        assert_eq!(rstd, std_plane);
    }

    #[test]
    fn test_header_template_fields() {
        let header = DetectorHeader::template(640, 480, 1, 25.0);
        assert_eq!(header.nrows, 480);
        assert_eq!(header.ncols, 640);
        assert_eq!(header.nframes, 256);
        assert_eq!(header.first, 0);
        assert_eq!(header.camno, 1);
        assert_eq!(header.decimation, 1);
        assert_eq!(header.interleave, 0);
        assert_eq!(header.fps_milli, 25_000);
    }

    #[test]
    fn test_version_marker_is_minus_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("version.bin");
        let header = DetectorHeader::template(1, 1, 0, 25.0);
        write_block_file(&path, &header, &[0], &[0], &[0], &[0]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let version = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(version, -1);
        assert_eq!(bytes.len(), HEADER_LEN + 4);
    }

    #[test]
    fn test_plane_length_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        let header = DetectorHeader::template(2, 2, 0, 25.0);
        let err = write_block_file(&path, &header, &[0, 0, 0], &[0, 0, 0, 0], &[0, 0, 0, 0], &[0, 0, 0, 0])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_canonical_filename_format() {
        // 2024-03-05T06:07:08.123Z
        let dt = DateTime::parse_from_rfc3339("2024-03-05T06:07:08.123Z").unwrap();
        let ts_ms = dt.timestamp_millis() as u64;
        let name = canonical_filename("AB0001", ts_ms);
        assert_eq!(name, "FF_AB0001_20240305_060708_123_000000.bin");
    }
}
