use crate::error::{DbError, DbResult};
use crate::io::{ByteReader, ByteWriter};
use crate::types::PageId;

/// On-disk size of the typed page header.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Discriminates what a page stores. Byte 0 of every typed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Invalid = 0,
    Table = 1,
    Index = 2,
    System = 3,
}

impl PageType {
    pub fn from_u8(v: u8) -> DbResult<Self> {
        match v {
            0 => Ok(PageType::Invalid),
            1 => Ok(PageType::Table),
            2 => Ok(PageType::Index),
            3 => Ok(PageType::System),
            other => Err(DbError::invalid(format!("unknown page type {}", other))),
        }
    }
}

/// Header laid down at the front of every typed page.
///
/// ```text
/// offset 0  : u8  page_type
/// offset 1  : i32 page_id
/// offset 5  : i32 prev_page_id   (-1 if none)
/// offset 9  : i32 next_page_id   (-1 if none)
/// offset 13 : u16 free_space_offset
/// offset 15 : u16 free_space_size
/// offset 17 : u16 slot_count
/// offset 19 : u16 tuple_count
/// offset 21 : 3 bytes reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub page_id: PageId,
    pub prev_page_id: PageId,
    pub next_page_id: PageId,
    pub free_space_offset: u16,
    pub free_space_size: u16,
    pub slot_count: u16,
    pub tuple_count: u16,
}

impl PageHeader {
    pub fn new(page_type: PageType, page_id: PageId) -> Self {
        Self {
            page_type,
            page_id,
            prev_page_id: crate::types::INVALID_PAGE_ID,
            next_page_id: crate::types::INVALID_PAGE_ID,
            free_space_offset: 0,
            free_space_size: 0,
            slot_count: 0,
            tuple_count: 0,
        }
    }

    pub fn read_from(data: &[u8]) -> DbResult<Self> {
        let mut reader = ByteReader::new(data);
        let page_type = PageType::from_u8(reader.read_u8()?)?;
        let page_id = reader.read_i32()?;
        let prev_page_id = reader.read_i32()?;
        let next_page_id = reader.read_i32()?;
        let free_space_offset = reader.read_u16()?;
        let free_space_size = reader.read_u16()?;
        let slot_count = reader.read_u16()?;
        let tuple_count = reader.read_u16()?;
        Ok(Self {
            page_type,
            page_id,
            prev_page_id,
            next_page_id,
            free_space_offset,
            free_space_size,
            slot_count,
            tuple_count,
        })
    }

    pub fn write_to(&self, data: &mut [u8]) {
        let mut writer = ByteWriter::with_capacity(PAGE_HEADER_SIZE);
        writer.write_u8(self.page_type as u8);
        writer.write_i32(self.page_id);
        writer.write_i32(self.prev_page_id);
        writer.write_i32(self.next_page_id);
        writer.write_u16(self.free_space_offset);
        writer.write_u16(self.free_space_size);
        writer.write_u16(self.slot_count);
        writer.write_u16(self.tuple_count);
        let bytes = writer.to_padded_bytes(PAGE_HEADER_SIZE);
        data[..PAGE_HEADER_SIZE].copy_from_slice(&bytes);
    }
}

/// A fixed-size byte buffer, the unit of disk I/O and cache residency.
/// Pin counts and dirtiness live in the owning buffer pool frame.
pub struct Page {
    id: PageId,
    data: Vec<u8>,
}

impl Page {
    pub fn new(id: PageId, page_size: usize) -> Self {
        Self {
            id,
            data: vec![0; page_size],
        }
    }

    pub fn from_bytes(id: PageId, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    pub fn get_id(&self) -> PageId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    pub fn read_header(&self) -> DbResult<PageHeader> {
        PageHeader::read_from(&self.data)
    }

    pub fn write_header(&mut self, header: &PageHeader) {
        header.write_to(&mut self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut page = Page::new(7, 4096);
        let mut header = PageHeader::new(PageType::Table, 7);
        header.next_page_id = 9;
        header.free_space_offset = 24;
        header.free_space_size = 4072;
        header.slot_count = 3;
        header.tuple_count = 2;
        page.write_header(&header);

        let read = page.read_header().unwrap();
        assert_eq!(read, header);
    }

    #[test]
    fn test_zeroed_page_reads_invalid_type() {
        let page = Page::new(0, 4096);
        let header = page.read_header().unwrap();
        assert_eq!(header.page_type, PageType::Invalid);
    }

    #[test]
    fn test_header_layout_offsets() {
        let mut page = Page::new(3, 512);
        let mut header = PageHeader::new(PageType::Index, 3);
        header.prev_page_id = 1;
        header.next_page_id = -1;
        page.write_header(&header);

        let data = page.data();
        assert_eq!(data[0], PageType::Index as u8);
        assert_eq!(i32::from_le_bytes(data[1..5].try_into().unwrap()), 3);
        assert_eq!(i32::from_le_bytes(data[5..9].try_into().unwrap()), 1);
        assert_eq!(i32::from_le_bytes(data[9..13].try_into().unwrap()), -1);
    }
}
