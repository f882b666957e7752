use crate::error::{DbError, DbResult};
use crate::storage::{Page, PageHeader, PageType, PAGE_HEADER_SIZE};
use crate::types::PageId;

/// Record header preceding every stored record: total size including
/// this header (u32), tombstone flag (u8), next-free offset reserved
/// for tombstone chaining (u32).
pub const RECORD_HEADER_SIZE: usize = 9;

/// A slot is the u16 in-page offset of its record.
pub const SLOT_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub size: u32,
    pub is_deleted: bool,
    pub next_free_offset: u32,
}

/// Largest record payload a single empty page can hold.
pub fn max_record_payload(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE - RECORD_HEADER_SIZE - SLOT_SIZE
}

/// Slotted-page view over a pinned table page.
///
/// Records grow upward from the header; the slot array grows downward
/// from the page end. At all times
/// `free_space_offset + free_space_size + slot_count * SLOT_SIZE`
/// equals the page size.
pub struct TablePage<'a> {
    page: &'a mut Page,
}

impl<'a> TablePage<'a> {
    pub fn new(page: &'a mut Page) -> Self {
        Self { page }
    }

    /// Format a fresh page as an empty table page.
    pub fn init(page: &'a mut Page) -> Self {
        let page_size = page.size();
        let mut header = PageHeader::new(PageType::Table, page.get_id());
        header.free_space_offset = PAGE_HEADER_SIZE as u16;
        header.free_space_size = (page_size - PAGE_HEADER_SIZE) as u16;
        page.write_header(&header);
        Self { page }
    }

    pub fn header(&self) -> DbResult<PageHeader> {
        let header = self.page.read_header()?;
        if header.page_type != PageType::Table {
            return Err(DbError::corrupt(
                self.page.get_id(),
                "not a table page",
            ));
        }
        Ok(header)
    }

    fn page_id(&self) -> PageId {
        self.page.get_id()
    }

    pub fn next_page_id(&self) -> DbResult<PageId> {
        Ok(self.header()?.next_page_id)
    }

    pub fn set_next_page_id(&mut self, next: PageId) -> DbResult<()> {
        let mut header = self.header()?;
        header.next_page_id = next;
        self.page.write_header(&header);
        Ok(())
    }

    pub fn set_prev_page_id(&mut self, prev: PageId) -> DbResult<()> {
        let mut header = self.header()?;
        header.prev_page_id = prev;
        self.page.write_header(&header);
        Ok(())
    }

    pub fn can_fit(&self, payload_len: usize) -> DbResult<bool> {
        let needed = RECORD_HEADER_SIZE + payload_len + SLOT_SIZE;
        Ok(self.header()?.free_space_size as usize >= needed)
    }

    fn read_record_header(&self, offset: u16) -> DbResult<RecordHeader> {
        let data = self.page.data();
        let start = offset as usize;
        if start < PAGE_HEADER_SIZE || start + RECORD_HEADER_SIZE > data.len() {
            return Err(DbError::corrupt(
                self.page_id(),
                format!("record offset {} out of bounds", offset),
            ));
        }
        let size = u32::from_le_bytes(data[start..start + 4].try_into().unwrap());
        let is_deleted = data[start + 4] != 0;
        let next_free_offset =
            u32::from_le_bytes(data[start + 5..start + 9].try_into().unwrap());

        if (size as usize) < RECORD_HEADER_SIZE || start + size as usize > data.len() {
            return Err(DbError::corrupt(
                self.page_id(),
                format!("record at {} has implausible size {}", offset, size),
            ));
        }
        Ok(RecordHeader {
            size,
            is_deleted,
            next_free_offset,
        })
    }

    fn write_record_header(&mut self, offset: u16, header: &RecordHeader) {
        let start = offset as usize;
        let data = self.page.data_mut();
        data[start..start + 4].copy_from_slice(&header.size.to_le_bytes());
        data[start + 4] = header.is_deleted as u8;
        data[start + 5..start + 9].copy_from_slice(&header.next_free_offset.to_le_bytes());
    }

    /// Append a serialized record, returning its in-page offset.
    pub fn insert_record(&mut self, payload: &[u8]) -> DbResult<u16> {
        let mut header = self.header()?;
        let needed = RECORD_HEADER_SIZE + payload.len() + SLOT_SIZE;
        if (header.free_space_size as usize) < needed {
            return Err(DbError::RecordTooLarge {
                size: payload.len(),
                capacity: header.free_space_size as usize,
            });
        }

        let offset = header.free_space_offset;
        self.write_record_header(
            offset,
            &RecordHeader {
                size: (RECORD_HEADER_SIZE + payload.len()) as u32,
                is_deleted: false,
                next_free_offset: 0,
            },
        );
        let start = offset as usize + RECORD_HEADER_SIZE;
        self.page.data_mut()[start..start + payload.len()].copy_from_slice(payload);

        // the slot array grows backward from the page end
        let page_size = self.page.size();
        let slot_pos = page_size - (header.slot_count as usize + 1) * SLOT_SIZE;
        self.page.data_mut()[slot_pos..slot_pos + SLOT_SIZE]
            .copy_from_slice(&offset.to_le_bytes());

        header.free_space_offset += (RECORD_HEADER_SIZE + payload.len()) as u16;
        header.free_space_size -= needed as u16;
        header.slot_count += 1;
        header.tuple_count += 1;
        self.page.write_header(&header);
        Ok(offset)
    }

    /// Payload bytes of the live record at `offset`, `None` for a
    /// tombstone.
    pub fn read_record(&self, offset: u16) -> DbResult<Option<Vec<u8>>> {
        let record = self.read_record_header(offset)?;
        if record.is_deleted {
            return Ok(None);
        }
        let start = offset as usize + RECORD_HEADER_SIZE;
        let end = offset as usize + record.size as usize;
        Ok(Some(self.page.data()[start..end].to_vec()))
    }

    /// Overwrite a live record in place. The new payload must fit in
    /// the record's current footprint.
    pub fn overwrite_record(&mut self, offset: u16, payload: &[u8]) -> DbResult<()> {
        let record = self.read_record_header(offset)?;
        if record.is_deleted {
            return Err(DbError::invalid(format!(
                "overwrite of deleted record at ({}, {})",
                self.page_id(),
                offset
            )));
        }
        let available = record.size as usize - RECORD_HEADER_SIZE;
        if payload.len() > available {
            return Err(DbError::RecordTooLarge {
                size: payload.len(),
                capacity: available,
            });
        }

        self.write_record_header(
            offset,
            &RecordHeader {
                size: (RECORD_HEADER_SIZE + payload.len()) as u32,
                is_deleted: false,
                next_free_offset: record.next_free_offset,
            },
        );
        let start = offset as usize + RECORD_HEADER_SIZE;
        self.page.data_mut()[start..start + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Tombstone the record at `offset`. The slot stays; compaction is
    /// future work. Returns false if it was already deleted.
    pub fn mark_deleted(&mut self, offset: u16) -> DbResult<bool> {
        let mut record = self.read_record_header(offset)?;
        if record.is_deleted {
            return Ok(false);
        }
        record.is_deleted = true;
        self.write_record_header(offset, &record);

        let mut header = self.header()?;
        header.tuple_count -= 1;
        self.page.write_header(&header);
        Ok(true)
    }

    pub fn is_live(&self, offset: u16) -> DbResult<bool> {
        Ok(!self.read_record_header(offset)?.is_deleted)
    }

    /// In-page offsets of every live record, in slot order.
    pub fn live_offsets(&self) -> DbResult<Vec<u16>> {
        let header = self.header()?;
        let page_size = self.page.size();
        let mut offsets = Vec::with_capacity(header.tuple_count as usize);
        for slot in 0..header.slot_count as usize {
            let slot_pos = page_size - (slot + 1) * SLOT_SIZE;
            let offset = u16::from_le_bytes(
                self.page.data()[slot_pos..slot_pos + SLOT_SIZE]
                    .try_into()
                    .unwrap(),
            );
            if !self.read_record_header(offset)?.is_deleted {
                offsets.push(offset);
            }
        }
        Ok(offsets)
    }
}
