//! # Data Service
//!
//! Reads and writes document payloads as chains of data blocks. A document
//! that fits one page is a single block; larger payloads are split across
//! pages, each fragment linked to the next through its block header.
//!
//! Pages come from the snapshot's free-space slots, so fragments land in
//! pages that guarantee the fit, and every touched page is re-bucketed
//! afterwards.

use crate::config::{DATA_BLOCK_HEADER_SIZE, MAX_DATA_BYTES_PER_PAGE, PAGE_SLOT_SIZE};
use crate::storage::{DataPage, PageAddress, TypedPage};
use crate::transaction::Snapshot;
use crate::Result;

pub struct DataService<'a> {
    snapshot: &'a mut Snapshot,
}

impl<'a> DataService<'a> {
    pub fn new(snapshot: &'a mut Snapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&mut self) -> &mut Snapshot {
        self.snapshot
    }

    /// Writes `document` as a block chain, returning the head address.
    pub fn insert(&mut self, document: &[u8]) -> Result<PageAddress> {
        let mut remaining = document;
        let mut head = PageAddress::EMPTY;
        let mut previous = PageAddress::EMPTY;

        loop {
            // ask the free-space slots for a page that fits the whole rest,
            // or the largest single fragment
            let wanted = (remaining.len() + DATA_BLOCK_HEADER_SIZE + PAGE_SLOT_SIZE)
                .min(MAX_DATA_BYTES_PER_PAGE);
            let page_id = self.snapshot.get_free_data_page(wanted)?;

            let address = {
                let page = self.snapshot.get_page::<DataPage>(page_id)?;
                let available = page
                    .base()
                    .free_bytes()
                    .saturating_sub(DATA_BLOCK_HEADER_SIZE + PAGE_SLOT_SIZE)
                    .min(MAX_DATA_BYTES_PER_PAGE);
                let take = remaining.len().min(available);
                let (fragment, rest) = remaining.split_at(take);
                remaining = rest;
                page.insert_block(fragment)?
            };
            self.snapshot.add_or_remove_free_data_list(page_id)?;

            if head.is_empty() {
                head = address;
            } else {
                let page = self.snapshot.get_page::<DataPage>(previous.page_id)?;
                page.set_next_block(previous.index, address)?;
            }
            previous = address;

            if remaining.is_empty() {
                return Ok(head);
            }
        }
    }

    /// Reassembles a document from its block chain.
    pub fn read(&mut self, address: PageAddress) -> Result<Vec<u8>> {
        let mut document = Vec::new();
        let mut current = address;

        while !current.is_empty() {
            let page = self.snapshot.get_page::<DataPage>(current.page_id)?;
            let block = page.get_block(current.index)?;
            document.extend_from_slice(page.block_payload(current.index)?);
            current = block.next_block;
        }
        Ok(document)
    }

    /// Deletes a whole block chain, re-bucketing (or deleting) every
    /// touched page.
    pub fn delete(&mut self, address: PageAddress) -> Result<()> {
        let mut current = address;

        while !current.is_empty() {
            let next = {
                let page = self.snapshot.get_page::<DataPage>(current.page_id)?;
                let next = page.get_block(current.index)?.next_block;
                page.delete_block(current.index)?;
                next
            };
            self.snapshot.add_or_remove_free_data_list(current.page_id)?;
            current = next;
        }
        Ok(())
    }
}
