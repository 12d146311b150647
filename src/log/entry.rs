use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Fixed-size header preceding every batch frame in a segment file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub base_offset: i64,
    pub count: i32,
    pub len: u32,
}

impl Entry {
    pub const SIZE: usize = 16;

    pub fn new(base_offset: i64, count: i32, len: u32) -> Entry {
        Entry {
            base_offset,
            count,
            len,
        }
    }

    pub fn next_offset(&self) -> i64 {
        self.base_offset + self.count as i64
    }

    pub fn frame_len(&self) -> u64 {
        Self::SIZE as u64 + self.len as u64
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_i64::<BigEndian>(self.base_offset)?;
        w.write_i32::<BigEndian>(self.count)?;
        w.write_u32::<BigEndian>(self.len)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Entry> {
        let mut buf = [0u8; Self::SIZE];
        r.read_exact(&mut buf)?;
        let mut cursor = Cursor::new(&buf[..]);
        Ok(Entry {
            base_offset: cursor.read_i64::<BigEndian>()?,
            count: cursor.read_i32::<BigEndian>()?,
            len: cursor.read_u32::<BigEndian>()?,
        })
    }
}

/// Where a batch frame lives inside its segment file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub entry: Entry,
    pub position: u64,
}

#[cfg(test)]
mod tests {
    use super::Entry;

    #[test]
    fn entry_to_bytes() {
        let mut bytes = Vec::new();
        Entry::new(10, 2, 111).write_to(&mut bytes).unwrap();
        assert_eq!(
            bytes,
            vec![0, 0, 0, 0, 0, 0, 0, 0x0A, 0, 0, 0, 0x02, 0, 0, 0, 0x6F]
        );
    }

    #[test]
    fn bytes_to_entry() {
        let bytes = vec![0, 0, 0, 0, 0, 0, 0, 0x0A, 0, 0, 0, 0x02, 0, 0, 0, 0x6F];
        let entry = Entry::read_from(&mut &bytes[..]).unwrap();
        assert_eq!(entry, Entry::new(10, 2, 111));
        assert_eq!(entry.next_offset(), 12);
        assert_eq!(entry.frame_len(), 127);
    }

    #[test]
    fn short_header() {
        let bytes = vec![0, 0, 0];
        assert!(Entry::read_from(&mut &bytes[..]).is_err());
    }
}
