//! Sequential WAL reader.

use super::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, WAL_VERSION, WalEntry, WalError};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

pub struct WalReader<R: Read> {
    reader: R,
    /// Byte offset of the next frame.
    offset: u64,
}

impl WalReader<BufReader<File>> {
    /// Open `path` and validate its version byte.
    ///
    /// A zero-length file is an empty log.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> WalReader<R> {
    pub fn new(mut reader: R) -> Result<Self, WalError> {
        let mut version = [0u8; 1];
        let n = read_full(&mut reader, &mut version)?;
        if n == 1 && version[0] != WAL_VERSION {
            return Err(WalError::UnsupportedVersion {
                found: version[0],
                expected: WAL_VERSION,
            });
        }
        Ok(Self {
            reader,
            offset: n as u64,
        })
    }

    /// Offset just past the last frame read in full.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next frame, `None` at a clean end of file.
    pub fn read_entry(&mut self) -> Result<Option<WalEntry>, WalError> {
        let frame_offset = self.offset;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match read_full(&mut self.reader, &mut header)? {
            0 => return Ok(None),
            n if n < FRAME_HEADER_SIZE => {
                return Err(WalError::Truncated {
                    offset: frame_offset,
                });
            }
            _ => {}
        }

        let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WalError::Corrupt {
                offset: frame_offset,
                reason: format!("payload length {} exceeds limit", payload_len),
            });
        }

        let mut weight = [0u8; 8];
        weight.copy_from_slice(&header[4..12]);
        let mut relay_hash = [0u8; 32];
        relay_hash.copy_from_slice(&header[12..44]);

        let mut payload = vec![0u8; payload_len];
        if read_full(&mut self.reader, &mut payload)? < payload_len {
            return Err(WalError::Truncated {
                offset: frame_offset,
            });
        }

        self.offset += (FRAME_HEADER_SIZE + payload_len) as u64;
        Ok(Some(WalEntry {
            relay_hash,
            weight: u64::from_le_bytes(weight),
            payload,
        }))
    }

    /// Iterate over all entries
    pub fn iter(&mut self) -> WalEntryIterator<'_, R> {
        WalEntryIterator { reader: self }
    }
}

/// Iterator over WAL entries; stops after the first error.
pub struct WalEntryIterator<'a, R: Read> {
    reader: &'a mut WalReader<R>,
}

impl<R: Read> Iterator for WalEntryIterator<'_, R> {
    type Item = Result<WalEntry, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.read_entry().transpose()
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encoded(frames: &[(&[u8; 32], &[u8], u64)]) -> Vec<u8> {
        let mut buf = vec![WAL_VERSION];
        for (hash, payload, weight) in frames {
            WalEntry::encode_into(hash, payload, *weight, &mut buf);
        }
        buf
    }

    #[test]
    fn test_reads_frames_in_order() {
        let bytes = encoded(&[(&[1; 32], b"one", 10), (&[2; 32], b"two", 20)]);
        let mut reader = WalReader::new(Cursor::new(bytes)).unwrap();
        let entries: Vec<_> = reader.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].relay_hash, [1; 32]);
        assert_eq!(entries[0].weight, 10);
        assert_eq!(entries[1].payload, b"two");
    }

    #[test]
    fn test_empty_input_is_empty_log() {
        let mut reader = WalReader::new(Cursor::new(Vec::new())).unwrap();
        assert!(reader.read_entry().unwrap().is_none());

        let mut reader = WalReader::new(Cursor::new(vec![WAL_VERSION])).unwrap();
        assert!(reader.read_entry().unwrap().is_none());
    }

    #[test]
    fn test_truncated_header_is_error() {
        let mut bytes = encoded(&[(&[1; 32], b"one", 1)]);
        bytes.extend_from_slice(&[0u8; 10]);
        let mut reader = WalReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.read_entry().unwrap().is_some());
        assert!(matches!(
            reader.read_entry(),
            Err(WalError::Truncated { offset }) if offset == 1 + 44 + 3
        ));
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let mut bytes = encoded(&[(&[1; 32], b"payload", 1)]);
        bytes.truncate(bytes.len() - 2);
        let mut reader = WalReader::new(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            reader.read_entry(),
            Err(WalError::Truncated { offset: 1 })
        ));
    }

    #[test]
    fn test_oversized_payload_is_corrupt() {
        let mut bytes = vec![WAL_VERSION];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 40]);
        let mut reader = WalReader::new(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            reader.read_entry(),
            Err(WalError::Corrupt { .. })
        ));
    }
}
