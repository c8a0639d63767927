//! Constant database (cdb) writer and reader.
//!
//! Layout: a 2048-byte header of 256 `(table_pos, table_len)` pairs, then
//! records `klen, dlen, key, data`, then 256 open-addressed hash tables of
//! `(hash, record_pos)` slots. All integers are little-endian `u32`.
//! Duplicate keys are allowed; lookups return every match in insert order.

use std::io::{BufWriter, Seek, SeekFrom, Write};

use crate::errors::{RecyclerError, RecyclerResult};

const HEADER_LEN: u32 = 2048;
const TABLES: usize = 256;

pub fn cdb_hash(key: &[u8]) -> u32 {
    key.iter().fold(5381u32, |h, &c| (h.wrapping_shl(5).wrapping_add(h)) ^ c as u32)
}

fn too_large() -> RecyclerError {
    RecyclerError::Roadmap("cdb output exceeds 4GB".to_string())
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct CdbWriter<W: Write + Seek> {
    out: BufWriter<W>,
    pos: u32,
    slots: Vec<(u32, u32)>,
}

impl<W: Write + Seek> CdbWriter<W> {
    pub fn new(inner: W) -> RecyclerResult<Self> {
        let mut out = BufWriter::new(inner);
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&[0u8; HEADER_LEN as usize])?;
        Ok(Self {
            out,
            pos: HEADER_LEN,
            slots: Vec::new(),
        })
    }

    pub fn add(&mut self, key: &[u8], data: &[u8]) -> RecyclerResult<()> {
        let klen = u32::try_from(key.len()).map_err(|_| too_large())?;
        let dlen = u32::try_from(data.len()).map_err(|_| too_large())?;
        self.out.write_all(&klen.to_le_bytes())?;
        self.out.write_all(&dlen.to_le_bytes())?;
        self.out.write_all(key)?;
        self.out.write_all(data)?;

        self.slots.push((cdb_hash(key), self.pos));
        self.pos = self
            .pos
            .checked_add(8)
            .and_then(|p| p.checked_add(klen))
            .and_then(|p| p.checked_add(dlen))
            .ok_or_else(too_large)?;
        Ok(())
    }

    pub fn add_str(&mut self, key: &str, data: &str) -> RecyclerResult<()> {
        self.add(key.as_bytes(), data.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Write the hash tables and header, returning the inner writer.
    pub fn finish(mut self) -> RecyclerResult<W> {
        let mut buckets: Vec<Vec<(u32, u32)>> = vec![Vec::new(); TABLES];
        for &(hash, pos) in &self.slots {
            buckets[(hash & 0xff) as usize].push((hash, pos));
        }

        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        for bucket in &buckets {
            let table_len = bucket.len() * 2;
            let mut table = vec![(0u32, 0u32); table_len];
            for &(hash, pos) in bucket {
                let mut slot = ((hash >> 8) as usize) % table_len;
                while table[slot].1 != 0 {
                    slot = (slot + 1) % table_len;
                }
                table[slot] = (hash, pos);
            }

            let table_len = u32::try_from(table_len).map_err(|_| too_large())?;
            header.extend_from_slice(&self.pos.to_le_bytes());
            header.extend_from_slice(&table_len.to_le_bytes());

            for (hash, pos) in table {
                self.out.write_all(&hash.to_le_bytes())?;
                self.out.write_all(&pos.to_le_bytes())?;
            }
            self.pos = table_len
                .checked_mul(8)
                .and_then(|n| self.pos.checked_add(n))
                .ok_or_else(too_large)?;
        }

        self.out.seek(SeekFrom::Start(0))?;
        self.out.write_all(&header)?;
        self.out.flush()?;
        self.out
            .into_inner()
            .map_err(|e| RecyclerError::Io(e.into_error()))
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Read-only view over a complete cdb image held in memory.
pub struct CdbReader<'a> {
    data: &'a [u8],
}

impl<'a> CdbReader<'a> {
    pub fn new(data: &'a [u8]) -> RecyclerResult<Self> {
        if data.len() < HEADER_LEN as usize {
            return Err(RecyclerError::Malformed("cdb shorter than its header".to_string()));
        }
        Ok(Self { data })
    }

    fn u32_at(&self, offset: usize) -> RecyclerResult<u32> {
        self.data
            .get(offset..offset + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| RecyclerError::Malformed(format!("cdb truncated at {offset}")))
    }

    fn slice(&self, start: usize, len: usize) -> RecyclerResult<&'a [u8]> {
        self.data
            .get(start..start + len)
            .ok_or_else(|| RecyclerError::Malformed(format!("cdb truncated at {start}")))
    }

    fn record(&self, pos: usize) -> RecyclerResult<(&'a [u8], &'a [u8])> {
        let klen = self.u32_at(pos)? as usize;
        let dlen = self.u32_at(pos + 4)? as usize;
        let key = self.slice(pos + 8, klen)?;
        let data = self.slice(pos + 8 + klen, dlen)?;
        Ok((key, data))
    }

    /// Every value stored under `key`, in insert order.
    pub fn find_all(&self, key: &[u8]) -> RecyclerResult<Vec<&'a [u8]>> {
        let hash = cdb_hash(key);
        let bucket = (hash & 0xff) as usize * 8;
        let table_pos = self.u32_at(bucket)? as usize;
        let table_len = self.u32_at(bucket + 4)? as usize;

        let mut found = Vec::new();
        if table_len == 0 {
            return Ok(found);
        }
        let mut slot = ((hash >> 8) as usize) % table_len;
        for _ in 0..table_len {
            let entry = table_pos + slot * 8;
            let pos = self.u32_at(entry + 4)? as usize;
            if pos == 0 {
                break;
            }
            if self.u32_at(entry)? == hash {
                let (k, data) = self.record(pos)?;
                if k == key {
                    found.push(data);
                }
            }
            slot = (slot + 1) % table_len;
        }
        Ok(found)
    }

    pub fn get(&self, key: &[u8]) -> RecyclerResult<Option<&'a [u8]>> {
        Ok(self.find_all(key)?.into_iter().next())
    }

    /// All records in file order.
    pub fn records(&self) -> RecyclerResult<Vec<(&'a [u8], &'a [u8])>> {
        let mut end = self.data.len();
        for i in 0..TABLES {
            end = end.min(self.u32_at(i * 8)? as usize);
        }

        let mut out = Vec::new();
        let mut pos = HEADER_LEN as usize;
        while pos < end {
            let (key, data) = self.record(pos)?;
            pos += 8 + key.len() + data.len();
            out.push((key, data));
        }
        Ok(out)
    }
}
