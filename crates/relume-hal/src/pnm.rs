//! Binary PNM (`P5` greyscale / `P6` colour) frame files.
//!
//! Used to replay recorded frames through [`DirectoryCamera`] and to dump
//! preprocessing stages from the CLI.
//!
//! [`DirectoryCamera`]: crate::replay::DirectoryCamera

use std::fs;
use std::path::Path;

use relume_types::RelumeError;

use crate::camera::CameraFrame;

fn image_err(msg: impl Into<String>) -> RelumeError {
    RelumeError::Image(msg.into())
}

/// Decode a binary PGM or PPM buffer into an RGB24 frame.  Greyscale input
/// is expanded to three equal channels.
pub fn decode(bytes: &[u8]) -> Result<CameraFrame, RelumeError> {
    let mut cursor = 0usize;
    let magic = next_token(bytes, &mut cursor)?;
    let channels = match magic.as_str() {
        "P5" => 1,
        "P6" => 3,
        other => return Err(image_err(format!("unsupported PNM magic '{other}'"))),
    };
    let width = parse_field(bytes, &mut cursor, "width")?;
    let height = parse_field(bytes, &mut cursor, "height")?;
    let maxval = parse_field(bytes, &mut cursor, "maxval")?;
    if maxval == 0 || maxval > 255 {
        return Err(image_err(format!("unsupported maxval {maxval}")));
    }
    // Exactly one whitespace byte separates the header from the raster.
    cursor += 1;

    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(channels))
        .ok_or_else(|| image_err(format!("raster {width}x{height} is too large")))?;
    let end = cursor
        .checked_add(expected)
        .ok_or_else(|| image_err(format!("raster {width}x{height} is too large")))?;
    let raster = bytes
        .get(cursor..end)
        .ok_or_else(|| image_err(format!("truncated raster: expected {expected} bytes")))?;

    let scale = |v: u8| -> u8 {
        if maxval == 255 {
            v
        } else {
            ((u32::from(v) * 255 + maxval / 2) / maxval).min(255) as u8
        }
    };
    let data = if channels == 3 {
        raster.iter().map(|&v| scale(v)).collect()
    } else {
        raster
            .iter()
            .flat_map(|&v| {
                let g = scale(v);
                [g, g, g]
            })
            .collect()
    };
    Ok(CameraFrame { width, height, data })
}

/// Read a PGM/PPM file from disk.
pub fn read_frame(path: &Path) -> Result<CameraFrame, RelumeError> {
    let bytes = fs::read(path).map_err(|e| image_err(format!("failed to read {}: {e}", path.display())))?;
    decode(&bytes)
}

/// Encode an RGB24 frame as binary PPM.
pub fn encode_ppm(frame: &CameraFrame) -> Result<Vec<u8>, RelumeError> {
    if !frame.is_consistent() {
        return Err(image_err("frame buffer does not match its dimensions"));
    }
    let mut out = format!("P6\n{} {}\n255\n", frame.width, frame.height).into_bytes();
    out.extend_from_slice(&frame.data);
    Ok(out)
}

/// Encode an 8-bit greyscale raster as binary PGM.
pub fn encode_pgm(width: u32, height: u32, pixels: &[u8]) -> Result<Vec<u8>, RelumeError> {
    if pixels.len() != width as usize * height as usize {
        return Err(image_err("greyscale buffer does not match its dimensions"));
    }
    let mut out = format!("P5\n{width} {height}\n255\n").into_bytes();
    out.extend_from_slice(pixels);
    Ok(out)
}

pub fn write_ppm(path: &Path, frame: &CameraFrame) -> Result<(), RelumeError> {
    let bytes = encode_ppm(frame)?;
    fs::write(path, bytes).map_err(|e| image_err(format!("failed to write {}: {e}", path.display())))
}

pub fn write_pgm(path: &Path, width: u32, height: u32, pixels: &[u8]) -> Result<(), RelumeError> {
    let bytes = encode_pgm(width, height, pixels)?;
    fs::write(path, bytes).map_err(|e| image_err(format!("failed to write {}: {e}", path.display())))
}

/// Skip whitespace and `#` comments, then return the next token.
fn next_token(bytes: &[u8], cursor: &mut usize) -> Result<String, RelumeError> {
    loop {
        match bytes.get(*cursor) {
            Some(b) if b.is_ascii_whitespace() => *cursor += 1,
            Some(b'#') => {
                while let Some(&b) = bytes.get(*cursor) {
                    *cursor += 1;
                    if b == b'\n' {
                        break;
                    }
                }
            }
            Some(_) => break,
            None => return Err(image_err("unexpected end of PNM header")),
        }
    }
    let start = *cursor;
    while bytes.get(*cursor).is_some_and(|b| !b.is_ascii_whitespace()) {
        *cursor += 1;
    }
    Ok(String::from_utf8_lossy(&bytes[start..*cursor]).into_owned())
}

fn parse_field(bytes: &[u8], cursor: &mut usize, name: &str) -> Result<u32, RelumeError> {
    let token = next_token(bytes, cursor)?;
    token
        .parse()
        .map_err(|_| image_err(format!("invalid PNM {name} '{token}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_dimensions_are_rejected() {
        assert!(matches!(
            decode(b"P6 4294967295 4294967295 255\n"),
            Err(RelumeError::Image(_))
        ));
        assert!(matches!(
            decode(b"P5 4294967295 4294967295 255\n\x00"),
            Err(RelumeError::Image(_))
        ));
    }

    #[test]
    fn decodes_ppm_with_comment() {
        let mut bytes = b"P6\n# recorded on the field\n2 1\n255\n".to_vec();
        bytes.extend_from_slice(&[255, 0, 0, 0, 0, 255]);
        let frame = decode(&bytes).unwrap();
        assert_eq!((frame.width, frame.height), (2, 1));
        assert_eq!(frame.data, vec![255, 0, 0, 0, 0, 255]);
    }

    #[test]
    fn expands_pgm_to_rgb_and_rescales_maxval() {
        let mut bytes = b"P5 2 1 15\n".to_vec();
        bytes.extend_from_slice(&[15, 0]);
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.data, vec![255, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn rejects_truncated_and_unknown_files() {
        assert!(decode(b"P6\n4 4\n255\n\x00\x00").is_err());
        assert!(decode(b"P3\n1 1\n255\n0 0 0").is_err());
        assert!(decode(b"P6\n").is_err());
    }

    #[test]
    fn ppm_file_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.ppm");
        let frame = CameraFrame {
            width: 2,
            height: 2,
            data: (0..12).collect(),
        };
        write_ppm(&path, &frame).unwrap();
        assert_eq!(read_frame(&path).unwrap(), frame);
    }

    #[test]
    fn pgm_size_mismatch_is_rejected() {
        assert!(encode_pgm(3, 3, &[0; 8]).is_err());
        let bytes = encode_pgm(1, 1, &[7]).unwrap();
        assert_eq!(&bytes[..3], b"P5\n");
        assert_eq!(*bytes.last().unwrap(), 7);
    }
}
