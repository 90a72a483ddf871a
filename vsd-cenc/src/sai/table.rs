use super::SampleAuxInfo;
use crate::{
    error::{DecryptError, MalformedInput, Result},
    key_info::KeyInfoRecord,
    reader::Reader,
};
use std::io::{self, Read, Seek, SeekFrom};

/// Sample auxiliary information sizes (`saiz` payload, after version and flags).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaiSizeTable {
    pub aux_info_type: Option<(u32, u32)>,
    pub default_size: u8,
    pub sample_count: u32,
    /// Empty when every sample uses `default_size`.
    pub sizes: Vec<u8>,
}

impl SaiSizeTable {
    pub fn parse(flags: u32, payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);

        let aux_info_type = if flags & 1 != 0 {
            Some((reader.read_u32()?, reader.read_u32()?))
        } else {
            None
        };

        let default_size = reader.read_u8()?;
        let sample_count = reader.read_u32()?;
        let sizes = if default_size == 0 {
            reader.read_bytes_u8(sample_count as usize)?.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            aux_info_type,
            default_size,
            sample_count,
            sizes,
        })
    }

    pub fn size(&self, sample_index: u32) -> Option<u8> {
        if sample_index >= self.sample_count {
            return None;
        }

        if self.default_size != 0 {
            Some(self.default_size)
        } else {
            self.sizes.get(sample_index as usize).copied()
        }
    }
}

/// Offsets into the auxiliary data region (`saio` payload, after version and flags).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaiOffsetTable {
    pub aux_info_type: Option<(u32, u32)>,
    pub offsets: Vec<u64>,
}

impl SaiOffsetTable {
    pub fn parse(version: u8, flags: u32, payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);

        let aux_info_type = if flags & 1 != 0 {
            Some((reader.read_u32()?, reader.read_u32()?))
        } else {
            None
        };

        let entry_count = reader.read_u32()? as usize;
        let width = if version == 0 { 4 } else { 8 };

        if reader.remaining() < entry_count.saturating_mul(width) {
            return Err(DecryptError::invalid(format!(
                "saio declares {} entries but only {} bytes are left",
                entry_count,
                reader.remaining()
            )));
        }

        let mut offsets = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            offsets.push(reader.read_uint(width)?);
        }

        Ok(Self {
            aux_info_type,
            offsets,
        })
    }
}

/// Random access to the region holding the auxiliary data.
pub trait AuxSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl AuxSource for &[u8] {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let available = self.len().saturating_sub(start);

        match start.checked_add(buf.len()) {
            Some(end) if end <= self.len() => {
                buf.copy_from_slice(&self[start..end]);
                Ok(())
            }
            _ => Err(MalformedInput::ShortRead {
                offset: start,
                needed: buf.len(),
                available,
            }
            .into()),
        }
    }
}

/// [`AuxSource`] over any seekable reader, such as an open file.
pub struct StreamSource<R>(pub R);

impl<R: Read + Seek> AuxSource for StreamSource<R> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let needed = buf.len();
        self.0
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.0.read_exact(buf))
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => DecryptError::from(MalformedInput::ShortRead {
                    offset: offset as usize,
                    needed,
                    available: 0,
                }),
                _ => DecryptError::invalid(format!(
                    "cannot read auxiliary data at offset {}: {}",
                    offset, e
                )),
            })
    }
}

/// Resolves per-sample auxiliary data through `saiz`/`saio` tables.
///
/// With a single offset entry samples are stored back to back, the reader keeps the
/// offset of the last sample it resolved so that sequential access stays O(1).
pub struct SaiTableReader {
    sizes: SaiSizeTable,
    offsets: SaiOffsetTable,
    last: Option<(u32, u64)>,
}

impl SaiTableReader {
    pub fn new(sizes: SaiSizeTable, offsets: SaiOffsetTable) -> Result<Self> {
        if offsets.offsets.is_empty() {
            return Err(DecryptError::invalid("saio without entries"));
        }

        if offsets.offsets.len() != 1 && offsets.offsets.len() != sizes.sample_count as usize {
            return Err(DecryptError::invalid(format!(
                "saio has {} entries for {} samples",
                offsets.offsets.len(),
                sizes.sample_count
            )));
        }

        Ok(Self {
            sizes,
            offsets,
            last: None,
        })
    }

    pub fn sample_count(&self) -> u32 {
        self.sizes.sample_count
    }

    /// Offset and size of the auxiliary data of one sample.
    pub fn locate(&mut self, sample_index: u32) -> Result<(u64, u8)> {
        let size = self.sizes.size(sample_index).ok_or_else(|| {
            DecryptError::invalid(format!(
                "sample {} is out of range ({} samples)",
                sample_index, self.sizes.sample_count
            ))
        })?;

        if self.offsets.offsets.len() > 1 {
            return Ok((self.offsets.offsets[sample_index as usize], size));
        }

        let (mut index, mut offset) = match self.last {
            Some((index, offset)) if index <= sample_index => (index, offset),
            _ => (0, self.offsets.offsets[0]),
        };

        while index < sample_index {
            let previous = self.sizes.size(index).unwrap_or(0) as u64;
            offset = offset
                .checked_add(previous)
                .ok_or_else(|| DecryptError::invalid("auxiliary data offset overflow"))?;
            index += 1;
        }

        self.last = Some((sample_index, offset));
        Ok((offset, size))
    }

    pub fn read<S: AuxSource>(&mut self, source: &mut S, sample_index: u32) -> Result<Vec<u8>> {
        let (offset, size) = self.locate(sample_index)?;
        let mut buf = vec![0; size as usize];
        source.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn read_sample_info<S: AuxSource>(
        &mut self,
        source: &mut S,
        sample_index: u32,
        key_info: &KeyInfoRecord,
    ) -> Result<SampleAuxInfo> {
        let data = self.read(source, sample_index)?;
        SampleAuxInfo::parse(&data, key_info)
    }
}
