//! Object containers, directories and hash chains.
//!
//! A directory's content is a doubly linked chain of object containers, each
//! packing variable-length object records terminated by an all-zero record.
//! The directory's object points at the newest container so inserts find
//! free space in O(1). A per-directory hash table block maps `hash16 mod
//! buckets` to the head of a chain of object nodes linked through their
//! `next` fields.
//!
//! Everything above the allocators goes through here: create, delete and
//! rename of objects, growing a file's extent chain and trimming it back.

use alloc::vec::Vec;

use crate::errors::{CanFail, FsError};
use crate::fs::asfs::name;
use crate::fs::asfs::structs::{
    Be16, Be32, BlockId, DirInfo, ExtentBNode, FileInfo, HashTableHeader, ObjectBits,
    ObjectContainerHeader, ObjectDesc, ObjectNode, SoftLinkHeader, ALWAYS_FREE,
    HASH_TABLE_HEADER_SIZE, OBJECT_CONTAINER_HEADER_SIZE, OBJECT_DESC_SIZE, OBJECT_STRUCT_SIZE,
    RECYCLED_NODE,
};
use crate::fs::asfs::{AsfsVolume, Block};
use crate::fs::{IOResult, ObjectInfo, ObjectType};

/// Offset of the record following the one at `offset`: past the fixed part,
/// the NUL-terminated name and comment, rounded to 2-byte alignment.
pub(crate) fn next_object_offset(data: &[u8], offset: usize) -> usize {
    let mut p = offset + OBJECT_DESC_SIZE;
    let mut nuls = 0;

    while nuls < 2 && p < data.len() {
        if data[p] == 0 {
            nuls += 1;
        }
        p += 1;
    }

    if (p - offset) & 1 != 0 {
        p += 1;
    }
    p
}

/// The name bytes of the record at `offset`.
pub(crate) fn object_name(data: &[u8], offset: usize) -> &[u8] {
    let start = offset + OBJECT_DESC_SIZE;
    let mut end = start;

    while end < data.len() && data[end] != 0 {
        end += 1;
    }
    &data[start..end]
}

/// The comment bytes of the record at `offset`.
fn object_comment(data: &[u8], offset: usize) -> &[u8] {
    let mut start = offset + OBJECT_DESC_SIZE;
    while start < data.len() && data[start] != 0 {
        start += 1;
    }
    start += 1;

    let mut end = start;
    while end < data.len() && data[end] != 0 {
        end += 1;
    }
    data.get(start..end).unwrap_or(&[])
}

fn object_node_at(data: &[u8], offset: usize) -> u32 {
    let desc: ObjectDesc =
        bytemuck::pod_read_unaligned(&data[offset..offset + OBJECT_DESC_SIZE]);
    desc.objectnode.get()
}

/// Byte offsets of the live records in a container.
pub(crate) fn object_offsets(data: &[u8]) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut offset = OBJECT_CONTAINER_HEADER_SIZE;

    while offset + OBJECT_STRUCT_SIZE + 2 < data.len() && object_node_at(data, offset) > 0 {
        offsets.push(offset);
        offset = next_object_offset(data, offset);
    }

    offsets
}

/// Offset of the record matching `name`, if any.
pub(crate) fn find_object_by_name(
    data: &[u8],
    sought: &[u8],
    case_sensitive: bool,
) -> Option<usize> {
    object_offsets(data)
        .into_iter()
        .find(|&offset| name::name_eq(object_name(data, offset), sought, case_sensitive))
}

/// Offset of the record carrying `node`, if any.
pub(crate) fn find_object_by_node(data: &[u8], node: u32) -> Option<usize> {
    object_offsets(data)
        .into_iter()
        .find(|&offset| object_node_at(data, offset) == node)
}

/// Offset of the first unused byte in a container.
fn empty_space_offset(data: &[u8]) -> usize {
    let end = data.len() - OBJECT_STRUCT_SIZE - 2;
    let mut offset = OBJECT_CONTAINER_HEADER_SIZE;

    while offset < end && data[offset + OBJECT_DESC_SIZE] != 0 {
        offset = next_object_offset(data, offset);
    }
    offset
}

impl AsfsVolume {
    fn hash_buckets(&self) -> usize {
        (self.block_size as usize - HASH_TABLE_HEADER_SIZE) / 4
    }

    /// Locates the object record for `node`, returning its container and
    /// byte offset.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] when the node is unused or the record cannot be
    /// found in the container its node entry points at.
    pub(crate) fn read_object_record(&self, node: u32) -> IOResult<(Block, usize)> {
        let (node_bh, node_offset) = self.get_node(node)?;
        let container = node_bh.get::<ObjectNode>(node_offset).data.get();
        drop(node_bh);

        if container == 0 {
            return Err(FsError::NotFound);
        }

        let bh = self.read_checked(container, BlockId::OBJECT_CONTAINER)?;
        let offset = find_object_by_node(&bh.data, node).ok_or(FsError::NotFound)?;
        Ok((bh, offset))
    }

    /// Builds the public view of the record at `offset`.
    pub(crate) fn object_info(&self, bh: &Block, offset: usize) -> ObjectInfo {
        let desc: ObjectDesc = bh.get(offset);
        let container: ObjectContainerHeader = bh.get(0);

        let kind = if desc.bits.contains(ObjectBits::DIR) {
            ObjectType::Directory
        } else if desc.bits.contains(ObjectBits::LINK)
            && !desc.bits.contains(ObjectBits::HARDLINK)
        {
            ObjectType::SoftLink
        } else {
            ObjectType::File
        };

        // Permission presentation follows the mount-time triple, not the
        // on-disk protection word.
        let mode = match kind {
            ObjectType::File => self.options.mode,
            ObjectType::Directory => {
                let m = self.options.mode;
                m | if m & 0o400 != 0 { 0o100 } else { 0 }
                    | if m & 0o040 != 0 { 0o010 } else { 0 }
                    | if m & 0o004 != 0 { 0o001 } else { 0 }
            }
            ObjectType::SoftLink => 0o777,
        };

        ObjectInfo {
            node: desc.objectnode.get(),
            parent: container.parent.get(),
            name: object_name(&bh.data, offset).to_vec(),
            comment: object_comment(&bh.data, offset).to_vec(),
            kind,
            hidden: desc.bits.contains(ObjectBits::HIDDEN),
            protection: desc.protection.get(),
            mode,
            owner_uid: desc.owneruid.get(),
            owner_gid: desc.ownergid.get(),
            date_modified: crate::fs::asfs::DiskDate(desc.datemodified.get()),
            size: desc.file().size.get(),
            first_extent: desc.file().data.get(),
            hashtable: desc.dir().hashtable.get(),
            first_dir_block: desc.dir().firstdirblock.get(),
        }
    }

    /// Finds room for `bytes_needed` bytes of record in the directory behind
    /// `parent_node`, allocating and head-linking a fresh container when no
    /// chain container has space.
    fn find_object_space(
        &mut self,
        parent_node: u32,
        bytes_needed: usize,
    ) -> IOResult<(Block, usize)> {
        let (parent_bh, parent_offset) = self.read_object_record(parent_node)?;
        let mut next = parent_bh
            .get::<ObjectDesc>(parent_offset)
            .dir()
            .firstdirblock
            .get();
        drop(parent_bh);

        while next != 0 {
            let bh = self.read_checked(next, BlockId::OBJECT_CONTAINER)?;
            let empty = empty_space_offset(&bh.data);

            if self.block_size as usize - empty >= bytes_needed {
                return Ok((bh, empty));
            }
            next = bh.get::<ObjectContainerHeader>(0).next.get();
        }

        // The whole chain is packed; a fresh container becomes the new head.
        let new_block = self.alloc_admin_block()?;

        let (mut parent_bh, parent_offset) = self.read_object_record(parent_node)?;
        let mut parent_desc: ObjectDesc = parent_bh.get(parent_offset);
        let old_head = parent_desc.dir().firstdirblock.get();

        let mut bh = self.zeroed_block(new_block, BlockId::OBJECT_CONTAINER);
        let mut container: ObjectContainerHeader = bh.get(0);
        container.parent = Be32::new(parent_node);
        container.next = Be32::new(old_head);
        container.previous = Be32::ZERO;
        bh.put(0, &container);
        self.store(&mut bh)?;

        parent_desc.set_dir(DirInfo {
            hashtable: parent_desc.dir().hashtable,
            firstdirblock: Be32::new(new_block),
        });
        parent_bh.put(parent_offset, &parent_desc);
        self.store(&mut parent_bh)?;
        drop(parent_bh);

        if old_head != 0 {
            let mut old_bh = self.read_checked(old_head, BlockId::OBJECT_CONTAINER)?;
            let mut old_container: ObjectContainerHeader = old_bh.get(0);
            old_container.previous = Be32::new(new_block);
            old_bh.put(0, &old_container);
            self.store(&mut old_bh)?;
        }

        Ok((bh, OBJECT_CONTAINER_HEADER_SIZE))
    }

    /// Writes a new object record into the directory behind `parent_node`.
    ///
    /// The record is copied from `template`; a template with a non-zero node
    /// number reuses that node (the rename path), otherwise a fresh node is
    /// issued. New directories get their hash table, new soft links their
    /// link block, both lazily. The returned buffer holds the finished record
    /// and is stored by the caller.
    ///
    /// `force` skips the free-reserve and recycled-directory refusals; the
    /// rename restore path depends on that.
    pub(crate) fn create_object(
        &mut self,
        parent_node: u32,
        template: &ObjectDesc,
        name: &[u8],
        force: bool,
    ) -> IOResult<(Block, usize)> {
        if !force && self.free_blocks < ALWAYS_FREE {
            return Err(FsError::NoSpace);
        }
        if !force && parent_node == RECYCLED_NODE {
            return Err(FsError::Invalid);
        }

        let (parent_bh, parent_offset) = self.read_object_record(parent_node)?;
        let parent_desc: ObjectDesc = parent_bh.get(parent_offset);
        if !parent_desc.bits.contains(ObjectBits::DIR) {
            return Err(FsError::Invalid);
        }
        let hashblock = parent_desc.dir().hashtable.get();
        drop(parent_bh);

        let object_size = OBJECT_STRUCT_SIZE + name.len() + 2;
        let (mut bh, offset) = self.find_object_space(parent_node, object_size)?;

        bh.put(offset, template);
        let name_offset = offset + OBJECT_DESC_SIZE;
        bh.data[name_offset..name_offset + name.len()].copy_from_slice(name);
        bh.data[name_offset + name.len()] = 0;
        bh.data[name_offset + name.len() + 1] = 0;

        let hashvalue = name::hash(name, self.case_sensitive);

        let (mut node_bh, node_offset, nodeno, fresh) = if template.objectnode.get() != 0 {
            let (node_bh, node_offset) = self.get_node(template.objectnode.get())?;
            (node_bh, node_offset, template.objectnode.get(), false)
        } else {
            let (node_bh, node_offset, nodeno) = self.create_node()?;
            let mut desc: ObjectDesc = bh.get(offset);
            desc.objectnode = Be32::new(nodeno);
            bh.put(offset, &desc);
            (node_bh, node_offset, nodeno, true)
        };

        let mut record: ObjectNode = node_bh.get(node_offset);
        record.data = Be32::new(bh.number);
        if fresh {
            record.hash16 = Be16::new(hashvalue);
            record.next = Be32::ZERO;
        }

        if hashblock != 0 {
            let mut hash_bh = self.read_checked(hashblock, BlockId::HASH_TABLE)?;
            let bucket = HASH_TABLE_HEADER_SIZE + 4 * (hashvalue as usize % self.hash_buckets());

            let nexthash = hash_bh.get::<Be32>(bucket).get();
            hash_bh.put(bucket, &Be32::new(nodeno));
            self.store(&mut hash_bh)?;

            record.next = Be32::new(nexthash);
            record.hash16 = Be16::new(hashvalue);
        }

        node_bh.put(node_offset, &record);
        self.store(&mut node_bh)?;
        drop(node_bh);

        let desc: ObjectDesc = bh.get(offset);

        if desc.bits.contains(ObjectBits::DIR) && desc.dir().hashtable.get() == 0 {
            let table_block = self.alloc_admin_block()?;

            let mut table_bh = self.zeroed_block(table_block, BlockId::HASH_TABLE);
            let mut table: HashTableHeader = table_bh.get(0);
            table.parent = Be32::new(nodeno);
            table_bh.put(0, &table);
            self.store(&mut table_bh)?;

            let mut desc: ObjectDesc = bh.get(offset);
            desc.set_dir(DirInfo {
                hashtable: Be32::new(table_block),
                firstdirblock: desc.dir().firstdirblock,
            });
            bh.put(offset, &desc);
        }

        if desc.bits.contains(ObjectBits::LINK)
            && !desc.bits.contains(ObjectBits::HARDLINK)
            && desc.file().data.get() == 0
        {
            let link_block = self.alloc_admin_block()?;

            let mut link_bh = self.zeroed_block(link_block, BlockId::SOFT_LINK);
            let mut link: SoftLinkHeader = link_bh.get(0);
            link.parent = Be32::new(nodeno);
            link_bh.put(0, &link);
            self.store(&mut link_bh)?;

            let mut desc: ObjectDesc = bh.get(offset);
            desc.set_file(FileInfo {
                data: Be32::new(link_block),
                size: desc.file().size,
            });
            bh.put(offset, &desc);
        }

        Ok((bh, offset))
    }

    /// Splices `objectnode` out of its bucket chain in the parent's hash
    /// table, when the parent has one.
    fn dehash_object(&mut self, objectnode: u32, name: &[u8], parent_node: u32) -> CanFail<FsError> {
        let (parent_bh, parent_offset) = self.read_object_record(parent_node)?;
        let hashtable = parent_bh
            .get::<ObjectDesc>(parent_offset)
            .dir()
            .hashtable
            .get();
        drop(parent_bh);

        if hashtable == 0 {
            return Ok(());
        }

        let (target_bh, target_offset) = self.get_node(objectnode)?;
        let target: ObjectNode = target_bh.get(target_offset);
        drop(target_bh);

        let mut hash_bh = self.read_checked(hashtable, BlockId::HASH_TABLE)?;
        let hashvalue = name::hash(name, self.case_sensitive);
        let bucket = HASH_TABLE_HEADER_SIZE + 4 * (hashvalue as usize % self.hash_buckets());

        let head = hash_bh.get::<Be32>(bucket).get();
        if head == objectnode {
            hash_bh.put(bucket, &Be32::new(target.next.get()));
            return self.store(&mut hash_bh);
        }
        drop(hash_bh);

        let mut current = head;
        loop {
            if current == 0 {
                log::error!(
                    target: "asfs",
                    "hash chain of object {objectnode} is corrupt or incorrectly linked"
                );
                return Err(FsError::NotFound);
            }

            let (mut node_bh, node_offset) = self.get_node(current)?;
            let mut record: ObjectNode = node_bh.get(node_offset);

            if record.next.get() == objectnode {
                record.next = Be32::new(target.next.get());
                node_bh.put(node_offset, &record);
                return self.store(&mut node_bh);
            }

            current = record.next.get();
        }
    }

    /// Unlinks a container from its directory chain and frees its admin
    /// block, fixing sibling links or the parent's `firstdirblock`.
    fn remove_object_container(&mut self, bh: Block) -> CanFail<FsError> {
        let container: ObjectContainerHeader = bh.get(0);
        let own = bh.number;
        drop(bh);

        if container.next.get() != 0 && container.next.get() != own {
            let mut next_bh =
                self.read_checked(container.next.get(), BlockId::OBJECT_CONTAINER)?;
            let mut next: ObjectContainerHeader = next_bh.get(0);
            next.previous = container.previous;
            next_bh.put(0, &next);
            self.store(&mut next_bh)?;
        }

        if container.previous.get() != 0 && container.previous.get() != own {
            let mut prev_bh =
                self.read_checked(container.previous.get(), BlockId::OBJECT_CONTAINER)?;
            let mut previous: ObjectContainerHeader = prev_bh.get(0);
            previous.next = container.next;
            prev_bh.put(0, &previous);
            self.store(&mut prev_bh)?;
        } else {
            let (mut parent_bh, parent_offset) =
                self.read_object_record(container.parent.get())?;
            let mut parent_desc: ObjectDesc = parent_bh.get(parent_offset);
            parent_desc.set_dir(DirInfo {
                hashtable: parent_desc.dir().hashtable,
                firstdirblock: container.next,
            });
            parent_bh.put(parent_offset, &parent_desc);
            self.store(&mut parent_bh)?;
        }

        self.free_admin_block(own)
    }

    /// Removes the record at `offset` from its container, releasing the
    /// container when this was its last record. Does not touch the hash
    /// chain.
    fn simple_remove_object(&mut self, mut bh: Block, offset: usize) -> CanFail<FsError> {
        let container: ObjectContainerHeader = bh.get(0);

        if container.parent.get() == RECYCLED_NODE {
            let desc: ObjectDesc = bh.get(offset);
            if !desc.bits.contains(ObjectBits::DIR) {
                let blocks = self.size_to_blocks(desc.file().size.get());
                self.update_root_info(|info| {
                    info.deletedfiles = Be32::new(info.deletedfiles.get().wrapping_sub(1));
                    info.deletedblocks =
                        Be32::new(info.deletedblocks.get().wrapping_sub(blocks));
                })?;
            }
        }

        let second = next_object_offset(&bh.data, OBJECT_CONTAINER_HEADER_SIZE);
        let lone = second + OBJECT_DESC_SIZE >= bh.data.len() || bh.data[second + OBJECT_DESC_SIZE] == 0;

        if lone {
            return self.remove_object_container(bh);
        }

        let next = next_object_offset(&bh.data, offset);
        let record_len = next - offset;
        let size = bh.data.len();

        bh.data.copy_within(next..size, offset);
        bh.data[size - record_len..].fill(0);

        self.store(&mut bh)
    }

    /// Deletes the object at `offset`: dehashes it, removes the record,
    /// frees the node number and releases whatever the object owned (extent
    /// chain, hash table or soft-link block).
    ///
    /// # Errors
    ///
    /// [`FsError::NotEmpty`] for a directory that still has entries.
    pub(crate) fn delete_object(&mut self, bh: Block, offset: usize) -> CanFail<FsError> {
        let desc: ObjectDesc = bh.get(offset);

        if desc.bits.contains(ObjectBits::DIR) && desc.dir().firstdirblock.get() != 0 {
            return Err(FsError::NotEmpty);
        }

        let bits = desc.bits;
        let hashblock = desc.dir().hashtable.get();
        let data = desc.file().data.get();
        let nodeno = desc.objectnode.get();
        let parent = bh.get::<ObjectContainerHeader>(0).parent.get();
        let name = object_name(&bh.data, offset).to_vec();

        self.dehash_object(nodeno, &name, parent)?;
        self.simple_remove_object(bh, offset)?;
        self.delete_node(nodeno)?;

        if bits.contains(ObjectBits::LINK) {
            self.free_admin_block(data)?;
        } else if bits.contains(ObjectBits::DIR) {
            if hashblock != 0 {
                self.free_admin_block(hashblock)?;
            }
        } else if data != 0 {
            self.delete_extents(data)?;
        }

        self.extent_cache.remove(&nodeno);
        Ok(())
    }

    /// Moves the object behind `src_node` into the directory behind
    /// `new_parent` under `new_name`, keeping its node number. A failed
    /// re-insert restores the object in its old place before reporting the
    /// error.
    pub(crate) fn rename_object(
        &mut self,
        src_node: u32,
        new_parent: u32,
        new_name: &[u8],
    ) -> CanFail<FsError> {
        let (src_bh, src_offset) = self.read_object_record(src_node)?;
        let template: ObjectDesc = src_bh.get(src_offset);
        let old_name = object_name(&src_bh.data, src_offset).to_vec();
        let old_parent = src_bh.get::<ObjectContainerHeader>(0).parent.get();

        self.dehash_object(src_node, &old_name, old_parent)?;
        self.simple_remove_object(src_bh, src_offset)?;

        match self.create_object(new_parent, &template, new_name, true) {
            Ok((mut bh, offset)) => {
                self.store(&mut bh)?;
                if new_parent == RECYCLED_NODE {
                    self.account_recycled_insert(&bh, offset)?;
                }
                Ok(())
            }
            Err(e) => {
                // Put the object back where it came from; the volume was
                // consistent before, so this is expected to succeed.
                match self.create_object(old_parent, &template, &old_name, true) {
                    Ok((mut bh, offset)) => {
                        self.store(&mut bh)?;
                        if old_parent == RECYCLED_NODE {
                            self.account_recycled_insert(&bh, offset)?;
                        }
                    }
                    Err(restore) => {
                        log::error!(
                            target: "asfs",
                            "could not restore object {src_node} after failed rename: {restore:?}"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    fn account_recycled_insert(&mut self, bh: &Block, offset: usize) -> CanFail<FsError> {
        let desc: ObjectDesc = bh.get(offset);
        if desc.bits.contains(ObjectBits::DIR) {
            return Ok(());
        }

        let blocks = self.size_to_blocks(desc.file().size.get());
        self.update_root_info(|info| {
            info.deletedfiles = Be32::new(info.deletedfiles.get().wrapping_add(1));
            info.deletedblocks = Be32::new(info.deletedblocks.get().wrapping_add(blocks));
        })
    }

    /// Grows the file behind `obj_node` by up to `blocks` blocks, appending
    /// one new run found near the end of the file. Returns the run start and
    /// the number of blocks actually added, which can be less than asked.
    pub(crate) fn add_blocks_to_file(
        &mut self,
        obj_node: u32,
        blocks: u32,
    ) -> IOResult<(u32, u32)> {
        let (mut bh, offset) = self.read_object_record(obj_node)?;
        let desc: ObjectDesc = bh.get(offset);

        let mut last = desc.file().data.get();
        let search_start = if last != 0 {
            loop {
                let (extent_bh, extent_offset) = self.get_extent(last)?;
                let extent: ExtentBNode = extent_bh.get(extent_offset);
                if extent.next.get() == 0 {
                    last = extent.key.get();
                    break extent.key.get() + u32::from(extent.blocks.get());
                }
                last = extent.next.get();
            }
        } else {
            self.roving_block_ptr
        };

        let want = blocks.min(0xffff);
        let (found_block, found_blocks) = self.find_space(want, search_start, search_start)?;
        self.mark_space(found_block, found_blocks)?;
        self.add_blocks(found_blocks as u16, found_block, obj_node, &mut last)?;

        let mut desc: ObjectDesc = bh.get(offset);
        if desc.file().data.get() == 0 {
            desc.set_file(FileInfo {
                data: Be32::new(last),
                size: desc.file().size,
            });
            bh.put(offset, &desc);
        }
        self.store(&mut bh)?;

        Ok((found_block, found_blocks))
    }

    /// Trims the extent chain of the file behind `obj_node` down to
    /// `new_size` bytes, freeing everything past the end.
    pub(crate) fn truncate_blocks_in_file(
        &mut self,
        obj_node: u32,
        new_size: u32,
    ) -> CanFail<FsError> {
        let (bh, offset) = self.read_object_record(obj_node)?;
        let first = bh.get::<ObjectDesc>(offset).file().data.get();
        drop(bh);

        if first == 0 {
            return Ok(());
        }

        let new_blocks = self.size_to_blocks(new_size);

        // Find the extent that contains the new end of the file.
        let mut pos: u32 = 0;
        let mut key = first;
        let extent = loop {
            let (extent_bh, extent_offset) = self.get_extent(key)?;
            let extent: ExtentBNode = extent_bh.get(extent_offset);

            if pos + u32::from(extent.blocks.get()) >= new_blocks {
                break extent;
            }
            pos += u32::from(extent.blocks.get());

            if extent.next.get() == 0 {
                break extent;
            }
            key = extent.next.get();
        };

        let keep = (new_blocks - pos) as u16;
        let ekey = extent.key.get();
        let eprev = extent.prev.get();
        let enext = extent.next.get();
        let eblocks = extent.blocks.get();

        if eblocks < keep {
            log::error!(target: "asfs", "extent chain of object {obj_node} is too short");
            return Err(FsError::NotFound);
        }

        if eblocks > keep {
            self.free_space(ekey + u32::from(keep), u32::from(eblocks - keep))?;
        }

        // Settle the kept extent before the tail teardown shifts records
        // around its leaf.
        let (mut extent_bh, extent_offset) = self.get_extent(ekey)?;
        let mut kept: ExtentBNode = extent_bh.get(extent_offset);
        kept.blocks = Be16::new(keep);
        kept.next = Be32::ZERO;
        extent_bh.put(extent_offset, &kept);
        self.store(&mut extent_bh)?;
        drop(extent_bh);

        if enext > 0 {
            self.delete_extents(enext)?;
        }

        if keep == 0 {
            match crate::fs::asfs::structs::ExtentPrev::decode(eprev) {
                crate::fs::asfs::structs::ExtentPrev::Parent(_) => {
                    let (mut obj_bh, obj_offset) = self.read_object_record(obj_node)?;
                    let mut desc: ObjectDesc = obj_bh.get(obj_offset);
                    desc.set_file(FileInfo {
                        data: Be32::ZERO,
                        size: desc.file().size,
                    });
                    obj_bh.put(obj_offset, &desc);
                    self.store(&mut obj_bh)?;
                }
                crate::fs::asfs::structs::ExtentPrev::Extent(prev_key) => {
                    let (mut prev_bh, prev_offset) = self.get_extent(prev_key)?;
                    let mut prev: ExtentBNode = prev_bh.get(prev_offset);
                    prev.next = Be32::ZERO;
                    prev_bh.put(prev_offset, &prev);
                    self.store(&mut prev_bh)?;
                }
            }

            let (extent_bh, _) = self.get_extent(ekey)?;
            self.delete_bnode(extent_bh, ekey)?;
        }

        Ok(())
    }
}
