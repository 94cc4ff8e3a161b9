//! NPAR (Net Partition ARchive) format implementation
//!
//! A keyed archive of labelled, typed, flat arrays. One archive holds the
//! complete numerical state of a partition; missing entries are legal and
//! left to the caller to default.

use crate::{
    error::{Result, StorageError},
    magic,
    schemas::{calculate_checksum, validate_checksum},
};

use log::debug;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

/// Current NPAR schema version
pub const NPAR_VERSION: u32 = 1;

/// Element type of an archive entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    /// 8-bit signed integers
    I8 = 0,
    /// 16-bit signed integers
    I16 = 1,
    /// 32-bit signed integers
    I32 = 2,
    /// 32-bit IEEE floats
    F32 = 3,
}

impl ArrayKind {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::I8),
            1 => Ok(Self::I16),
            2 => Ok(Self::I32),
            3 => Ok(Self::F32),
            other => Err(StorageError::invalid_format(format!(
                "Unknown array kind tag {}",
                other
            ))),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::F32 => "f32",
        }
    }

    fn elem_size(&self) -> usize {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
            Self::F32 => 4,
        }
    }
}

/// A single typed array entry
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    /// 8-bit signed integers
    I8(Vec<i8>),
    /// 16-bit signed integers
    I16(Vec<i16>),
    /// 32-bit signed integers
    I32(Vec<i32>),
    /// 32-bit IEEE floats
    F32(Vec<f32>),
}

impl ArrayData {
    fn kind(&self) -> ArrayKind {
        match self {
            Self::I8(_) => ArrayKind::I8,
            Self::I16(_) => ArrayKind::I16,
            Self::I32(_) => ArrayKind::I32,
            Self::F32(_) => ArrayKind::F32,
        }
    }

    /// Number of elements in the entry
    pub fn len(&self) -> usize {
        match self {
            Self::I8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::F32(v) => v.len(),
        }
    }

    /// True if the entry holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keyed archive of labelled arrays
///
/// Entries are kept sorted by name so serialization is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrayArchive {
    entries: BTreeMap<String, ArrayData>,
}

impl ArrayArchive {
    /// Create an empty archive
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the archive holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if an entry with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Iterate over entry names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Insert an entry, replacing any previous one of the same name
    pub fn insert(&mut self, name: impl Into<String>, data: ArrayData) {
        self.entries.insert(name.into(), data);
    }

    /// Insert an i8 array
    pub fn insert_i8(&mut self, name: impl Into<String>, data: Vec<i8>) {
        self.insert(name, ArrayData::I8(data));
    }

    /// Insert an i16 array
    pub fn insert_i16(&mut self, name: impl Into<String>, data: Vec<i16>) {
        self.insert(name, ArrayData::I16(data));
    }

    /// Insert an i32 array
    pub fn insert_i32(&mut self, name: impl Into<String>, data: Vec<i32>) {
        self.insert(name, ArrayData::I32(data));
    }

    /// Insert an f32 array
    pub fn insert_f32(&mut self, name: impl Into<String>, data: Vec<f32>) {
        self.insert(name, ArrayData::F32(data));
    }

    /// Get an entry by name
    pub fn get(&self, name: &str) -> Option<&ArrayData> {
        self.entries.get(name)
    }

    /// Get an i8 entry; `Ok(None)` if absent, `Err` if present with another type
    pub fn get_i8(&self, name: &str) -> Result<Option<&[i8]>> {
        match self.entries.get(name) {
            None => Ok(None),
            Some(ArrayData::I8(v)) => Ok(Some(v)),
            Some(other) => Err(Self::type_mismatch(name, ArrayKind::I8, other)),
        }
    }

    /// Get an i16 entry; `Ok(None)` if absent, `Err` if present with another type
    pub fn get_i16(&self, name: &str) -> Result<Option<&[i16]>> {
        match self.entries.get(name) {
            None => Ok(None),
            Some(ArrayData::I16(v)) => Ok(Some(v)),
            Some(other) => Err(Self::type_mismatch(name, ArrayKind::I16, other)),
        }
    }

    /// Get an i32 entry; `Ok(None)` if absent, `Err` if present with another type
    pub fn get_i32(&self, name: &str) -> Result<Option<&[i32]>> {
        match self.entries.get(name) {
            None => Ok(None),
            Some(ArrayData::I32(v)) => Ok(Some(v)),
            Some(other) => Err(Self::type_mismatch(name, ArrayKind::I32, other)),
        }
    }

    /// Get an f32 entry; `Ok(None)` if absent, `Err` if present with another type
    pub fn get_f32(&self, name: &str) -> Result<Option<&[f32]>> {
        match self.entries.get(name) {
            None => Ok(None),
            Some(ArrayData::F32(v)) => Ok(Some(v)),
            Some(other) => Err(Self::type_mismatch(name, ArrayKind::F32, other)),
        }
    }

    fn type_mismatch(name: &str, expected: ArrayKind, found: &ArrayData) -> StorageError {
        StorageError::TypeMismatch {
            name: name.to_string(),
            expected: expected.name(),
            found: found.kind().name(),
        }
    }

    /// Serialize to bytes
    ///
    /// Layout: magic, version (u32), entry count (u32), payload length (u64),
    /// payload CRC32 (u32), then the payload. Each payload entry is
    /// name length (u16), name bytes, kind tag (u8), element count (u64),
    /// little-endian element data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for (name, data) in &self.entries {
            payload.extend_from_slice(&(name.len() as u16).to_le_bytes());
            payload.extend_from_slice(name.as_bytes());
            payload.push(data.kind() as u8);
            payload.extend_from_slice(&(data.len() as u64).to_le_bytes());
            match data {
                ArrayData::I8(v) => {
                    for &x in v {
                        payload.push(x as u8);
                    }
                }
                ArrayData::I16(v) => {
                    for &x in v {
                        payload.extend_from_slice(&x.to_le_bytes());
                    }
                }
                ArrayData::I32(v) => {
                    for &x in v {
                        payload.extend_from_slice(&x.to_le_bytes());
                    }
                }
                ArrayData::F32(v) => {
                    for &x in v {
                        payload.extend_from_slice(&x.to_le_bytes());
                    }
                }
            }
        }

        let mut bytes = Vec::with_capacity(24 + payload.len());
        bytes.extend_from_slice(&magic::NPAR);
        bytes.extend_from_slice(&NPAR_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&calculate_checksum(&payload).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes
    }

    /// Load from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let found = cursor.take_array::<4>()?;
        if found != magic::NPAR {
            return Err(StorageError::InvalidMagic {
                expected: magic::NPAR,
                found,
            });
        }

        let version = u32::from_le_bytes(cursor.take_array::<4>()?);
        if version != NPAR_VERSION {
            return Err(StorageError::UnsupportedVersion {
                version,
                supported: NPAR_VERSION,
            });
        }

        let entry_count = u32::from_le_bytes(cursor.take_array::<4>()?) as usize;
        let payload_len = u64::from_le_bytes(cursor.take_array::<8>()?) as usize;
        let checksum = u32::from_le_bytes(cursor.take_array::<4>()?);

        let payload = cursor.take_slice(payload_len)?;
        validate_checksum(payload, checksum)?;

        let mut entries = BTreeMap::new();
        let mut cursor = Cursor::new(payload);
        for _ in 0..entry_count {
            let name_len = u16::from_le_bytes(cursor.take_array::<2>()?) as usize;
            let name_bytes = cursor.take_slice(name_len)?;
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| StorageError::invalid_format("Entry name is not valid UTF-8"))?
                .to_string();
            let kind = ArrayKind::from_tag(cursor.take_array::<1>()?[0])?;
            let len = u64::from_le_bytes(cursor.take_array::<8>()?) as usize;
            let raw = cursor.take_slice(len * kind.elem_size())?;

            let data = match kind {
                ArrayKind::I8 => ArrayData::I8(raw.iter().map(|&b| b as i8).collect()),
                ArrayKind::I16 => ArrayData::I16(
                    raw.chunks_exact(2)
                        .map(|c| i16::from_le_bytes([c[0], c[1]]))
                        .collect(),
                ),
                ArrayKind::I32 => ArrayData::I32(
                    raw.chunks_exact(4)
                        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ),
                ArrayKind::F32 => ArrayData::F32(
                    raw.chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ),
            };
            entries.insert(name, data);
        }

        Ok(Self { entries })
    }

    /// Write the archive to a file
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.to_bytes())?;
        debug!(
            "wrote archive with {} entries to {}",
            self.entries.len(),
            path.display()
        );
        Ok(())
    }

    /// Read an archive from a file
    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let archive = Self::from_bytes(&bytes)?;
        debug!(
            "read archive with {} entries from {}",
            archive.entries.len(),
            path.display()
        );
        Ok(archive)
    }
}

/// Bounds-checked byte reader over a slice
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                StorageError::invalid_format(format!(
                    "Truncated archive: need {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.data.len().saturating_sub(self.pos)
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_archive() -> ArrayArchive {
        let mut archive = ArrayArchive::new();
        archive.insert_i32("allocated_nodes", vec![0, 6, 1, 0]);
        archive.insert_f32("a", vec![1.0, 0.5, -0.25]);
        archive.insert_i16("g_countdown", vec![-1, 3]);
        archive.insert_i8("n_function_selector", vec![0, 1, 2]);
        archive
    }

    #[test]
    fn test_roundtrip() {
        let archive = sample_archive();
        let bytes = archive.to_bytes();
        let loaded = ArrayArchive::from_bytes(&bytes).unwrap();
        assert_eq!(archive, loaded);
    }

    #[test]
    fn test_typed_access() {
        let archive = sample_archive();
        assert_eq!(
            archive.get_f32("a").unwrap(),
            Some(&[1.0, 0.5, -0.25][..])
        );
        assert_eq!(archive.get_i32("missing").unwrap(), None);
        assert!(matches!(
            archive.get_f32("allocated_nodes"),
            Err(StorageError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample_archive().to_bytes();
        bytes[0] = 0;
        assert!(matches!(
            ArrayArchive::from_bytes(&bytes),
            Err(StorageError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_corrupted_payload() {
        let mut bytes = sample_archive().to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            ArrayArchive::from_bytes(&bytes),
            Err(StorageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated() {
        let bytes = sample_archive().to_bytes();
        assert!(ArrayArchive::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partition_000.npar");
        let archive = sample_archive();
        archive.write_file(&path).unwrap();
        let loaded = ArrayArchive::read_file(&path).unwrap();
        assert_eq!(archive, loaded);
    }
}
