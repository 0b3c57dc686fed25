use std::fs;
use std::io::Read;
use std::path::Path;

use crate::core::error::{Error, Result};

/// Persisted envelope: `[magic u32][version u32][body_len u64][body_crc u32][body]`,
/// all fixed fields little-endian. Load validates magic, format version,
/// length and checksum before the body is decoded.
pub const FILE_HEADER_MAGIC: u32 = 0x544C_4254; // "TBLT"
pub const FILE_HEADER_VERSION: u32 = 1;
pub const FILE_HEADER_SIZE: usize = 20;

pub fn write_envelope(path: &Path, body: &[u8]) -> Result<()> {
    let mut data = Vec::with_capacity(FILE_HEADER_SIZE + body.len());
    data.extend_from_slice(&FILE_HEADER_MAGIC.to_le_bytes());
    data.extend_from_slice(&FILE_HEADER_VERSION.to_le_bytes());
    data.extend_from_slice(&(body.len() as u64).to_le_bytes());
    data.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
    data.extend_from_slice(body);
    fs::write(path, data)?;
    Ok(())
}

pub fn read_envelope(path: &Path) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    let mut header = [0u8; FILE_HEADER_SIZE];
    file.read_exact(&mut header)
        .map_err(|e| Error::corruption(format!("short header in {}: {e}", path.display())))?;

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != FILE_HEADER_MAGIC {
        return Err(Error::corruption(format!(
            "bad magic in {}: {magic:#010x}",
            path.display()
        )));
    }
    let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if version != FILE_HEADER_VERSION {
        return Err(Error::corruption(format!(
            "unsupported header version {version} in {}",
            path.display()
        )));
    }
    let body_len = u64::from_le_bytes(header[8..16].try_into().unwrap()) as usize;
    let expected_crc = u32::from_le_bytes(header[16..20].try_into().unwrap());

    let mut body = vec![0u8; body_len];
    file.read_exact(&mut body)
        .map_err(|e| Error::corruption(format!("truncated body in {}: {e}", path.display())))?;
    let crc = crc32fast::hash(&body);
    if crc != expected_crc {
        return Err(Error::corruption(format!(
            "checksum mismatch in {}: stored {expected_crc:#010x}, computed {crc:#010x}",
            path.display()
        )));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.hdr");
        write_envelope(&path, b"hello tablet").unwrap();
        assert_eq!(read_envelope(&path).unwrap(), b"hello tablet");
    }

    #[test]
    fn test_envelope_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.hdr");
        write_envelope(&path, b"payload").unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, data).unwrap();

        let err = read_envelope(&path).unwrap_err();
        assert!(err.is(crate::core::error::ErrorKind::Corruption));
    }

    #[test]
    fn test_envelope_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.hdr");
        fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(read_envelope(&path).is_err());
    }
}
