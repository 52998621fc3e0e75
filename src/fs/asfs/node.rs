//! Object-node tree.
//!
//! A height-adaptive sparse tree mapping the dense 32-bit node numbers to
//! the object container holding each object record. Leaf containers pack
//! 10-byte [`ObjectNode`] records; internal containers hold child pointers
//! encoding `block << (block_size_bits - 5)` with bit 0 as the subtree-full
//! flag, which create maintains on fill-up and delete clears again.
//!
//! The root block number never changes. When the root fills up a new level
//! is added by copying the root's content into a fresh admin block and
//! rewriting the root in place as an internal container.

use crate::errors::{CanFail, FsError};
use crate::fs::asfs::structs::{
    Be32, BlockId, NodeContainerHeader, ObjectNode, NODE_CONTAINER_HEADER_SIZE, NODE_PTR_SHIFT,
    NODE_STRUCT_SIZE,
};
use crate::fs::asfs::{AsfsVolume, Block};
use crate::fs::IOResult;

impl AsfsVolume {
    fn node_ptr_shift(&self) -> u32 {
        self.block_size_bits - NODE_PTR_SHIFT
    }

    /// Child pointers per internal container.
    fn node_children(&self) -> usize {
        (self.block_size as usize - NODE_CONTAINER_HEADER_SIZE) / 4
    }

    /// Records per leaf container.
    fn node_leaf_capacity(&self) -> usize {
        (self.block_size as usize - NODE_CONTAINER_HEADER_SIZE) / NODE_STRUCT_SIZE
    }

    fn child_ptr(bh: &Block, index: usize) -> u32 {
        bh.get::<Be32>(NODE_CONTAINER_HEADER_SIZE + index * 4).get()
    }

    fn set_child_ptr(bh: &mut Block, index: usize, raw: u32) {
        bh.put(NODE_CONTAINER_HEADER_SIZE + index * 4, &Be32::new(raw));
    }

    fn leaf_record_offset(index: usize) -> usize {
        NODE_CONTAINER_HEADER_SIZE + index * NODE_STRUCT_SIZE
    }

    /// Locates the record for `nodeno`, returning its container and byte
    /// offset.
    pub(crate) fn get_node(&self, nodeno: u32) -> IOResult<(Block, usize)> {
        let mut block = self.object_node_root;

        loop {
            let bh = self.read_checked(block, BlockId::NODE_CONTAINER)?;
            let header: NodeContainerHeader = bh.get(0);
            let base = header.nodenumber.get();

            if nodeno < base {
                return Err(FsError::NotFound);
            }

            if header.nodes.get() == 1 {
                let index = (nodeno - base) as usize;
                if index >= self.node_leaf_capacity() {
                    return Err(FsError::NotFound);
                }
                return Ok((bh, Self::leaf_record_offset(index)));
            }

            let entry = ((nodeno - base) / header.nodes.get()) as usize;
            if entry >= self.node_children() {
                return Err(FsError::NotFound);
            }

            let raw = Self::child_ptr(&bh, entry);
            if raw == 0 {
                return Err(FsError::NotFound);
            }
            block = raw >> self.node_ptr_shift();
        }
    }

    /// Finds the parent container of the container at `child_block` covering
    /// `child_nodenumber`, or `None` when the child is the root.
    fn parent_node_container(
        &self,
        child_block: u32,
        child_nodenumber: u32,
    ) -> IOResult<Option<Block>> {
        if self.object_node_root == child_block {
            return Ok(None);
        }

        let mut block = self.object_node_root;

        loop {
            let bh = self.read_checked(block, BlockId::NODE_CONTAINER)?;
            let header: NodeContainerHeader = bh.get(0);

            if header.nodes.get() == 1 {
                log::error!(
                    target: "asfs",
                    "node tree corrupted: no parent for container {child_block}"
                );
                return Err(FsError::Io);
            }

            let entry = ((child_nodenumber - header.nodenumber.get()) / header.nodes.get()) as usize;
            if entry >= self.node_children() {
                return Err(FsError::Io);
            }

            let next = Self::child_ptr(&bh, entry) >> self.node_ptr_shift();
            if next == child_block {
                return Ok(Some(bh));
            }
            block = next;
        }
    }

    /// Whether every child pointer of an internal container is present with
    /// its full bit set.
    fn container_is_full(&self, bh: &Block) -> bool {
        (0..self.node_children()).all(|i| {
            let raw = Self::child_ptr(bh, i);
            raw != 0 && raw & 1 != 0
        })
    }

    /// Marks the child covering `child_nodenumber` full in its parent,
    /// recursing upwards while the parent fills up too.
    fn mark_parent_full(&mut self, child_block: u32, child_nodenumber: u32) -> CanFail<FsError> {
        let Some(mut bh) = self.parent_node_container(child_block, child_nodenumber)? else {
            return Ok(());
        };

        let header: NodeContainerHeader = bh.get(0);
        let entry = ((child_nodenumber - header.nodenumber.get()) / header.nodes.get()) as usize;

        let raw = Self::child_ptr(&bh, entry) | 1;
        Self::set_child_ptr(&mut bh, entry, raw);
        self.store(&mut bh)?;

        if self.container_is_full(&bh) {
            let (block, nodenumber) = (bh.number, header.nodenumber.get());
            drop(bh);
            return self.mark_parent_full(block, nodenumber);
        }

        Ok(())
    }

    /// Clears the full bit for the child covering `child_nodenumber`,
    /// recursing upwards when the parent was itself full until now.
    fn mark_parent_empty(&mut self, child_block: u32, child_nodenumber: u32) -> CanFail<FsError> {
        let Some(mut bh) = self.parent_node_container(child_block, child_nodenumber)? else {
            return Ok(());
        };

        let header: NodeContainerHeader = bh.get(0);
        let entry = ((child_nodenumber - header.nodenumber.get()) / header.nodes.get()) as usize;
        let was_full = self.container_is_full(&bh);

        let raw = Self::child_ptr(&bh, entry) & !1;
        Self::set_child_ptr(&mut bh, entry, raw);
        self.store(&mut bh)?;

        if was_full {
            let (block, nodenumber) = (bh.number, header.nodenumber.get());
            drop(bh);
            return self.mark_parent_empty(block, nodenumber);
        }

        Ok(())
    }

    /// Adds a level to the tree: the root's content moves into a fresh admin
    /// block and the root block is rewritten as an internal container whose
    /// only child is that copy, marked full.
    fn add_new_level(&mut self) -> CanFail<FsError> {
        let bh = self.read_checked(self.object_node_root, BlockId::NODE_CONTAINER)?;
        let header: NodeContainerHeader = bh.get(0);

        let new_block = self.alloc_admin_block()?;

        let mut copy = Block {
            number: new_block,
            data: bh.data.clone(),
        };
        let mut copy_header: NodeContainerHeader = copy.get(0);
        copy_header.header.ownblock = Be32::new(new_block);
        copy.put(0, &copy_header);
        self.store(&mut copy)?;

        let mut root = self.zeroed_block(self.object_node_root, BlockId::NODE_CONTAINER);
        let nodes = if header.nodes.get() == 1 {
            self.node_leaf_capacity() as u32
        } else {
            header.nodes.get() * self.node_children() as u32
        };
        let mut root_header: NodeContainerHeader = root.get(0);
        root_header.nodenumber = header.nodenumber;
        root_header.nodes = Be32::new(nodes);
        root.put(0, &root_header);
        Self::set_child_ptr(&mut root, 0, (new_block << self.node_ptr_shift()) | 1);
        self.store(&mut root)
    }

    fn create_node_container(&mut self, nodenumber: u32, nodes: u32) -> IOResult<u32> {
        let new_block = self.alloc_admin_block()?;

        let mut bh = self.zeroed_block(new_block, BlockId::NODE_CONTAINER);
        let mut header: NodeContainerHeader = bh.get(0);
        header.nodenumber = Be32::new(nodenumber);
        header.nodes = Be32::new(nodes);
        bh.put(0, &header);
        self.store(&mut bh)?;

        Ok(new_block)
    }

    /// Issues a node number, returning the leaf container, the record's byte
    /// offset and the number. The record's `data` is still zero; the caller
    /// fills it in and stores the buffer.
    pub(crate) fn create_node(&mut self) -> IOResult<(Block, usize, u32)> {
        let leaf_capacity = self.node_leaf_capacity();
        let children = self.node_children();
        let mut block = self.object_node_root;

        loop {
            let mut bh = self.read_checked(block, BlockId::NODE_CONTAINER)?;
            let header: NodeContainerHeader = bh.get(0);

            if header.nodes.get() == 1 {
                let free = (0..leaf_capacity).find(|&i| {
                    bh.get::<ObjectNode>(Self::leaf_record_offset(i)).data.get() == 0
                });

                match free {
                    Some(index) => {
                        let nodeno = header.nodenumber.get() + index as u32;

                        let more = (index + 1..leaf_capacity).any(|i| {
                            bh.get::<ObjectNode>(Self::leaf_record_offset(i)).data.get() == 0
                        });
                        if !more {
                            // Taking this record fills the container.
                            self.mark_parent_full(bh.number, header.nodenumber.get())?;
                        }

                        return Ok((bh, Self::leaf_record_offset(index), nodeno));
                    }
                    None => {
                        if self.object_node_root != block {
                            log::error!(
                                target: "asfs",
                                "full leaf container {block} reached through a clear full bit"
                            );
                            return Err(FsError::NoSpace);
                        }
                        drop(bh);
                        self.add_new_level()?;
                        block = self.object_node_root;
                    }
                }
            } else {
                let open = (0..children).find_map(|i| {
                    let raw = Self::child_ptr(&bh, i);
                    (raw != 0 && raw & 1 == 0).then_some(raw)
                });

                if let Some(raw) = open {
                    block = raw >> self.node_ptr_shift();
                    continue;
                }

                let unused = (0..children).find(|&i| Self::child_ptr(&bh, i) == 0);

                match unused {
                    Some(index) => {
                        let nodes = if header.nodes.get() == leaf_capacity as u32 {
                            1
                        } else {
                            header.nodes.get() / children as u32
                        };
                        let child_base =
                            header.nodenumber.get() + index as u32 * header.nodes.get();

                        let new_block = self.create_node_container(child_base, nodes)?;
                        Self::set_child_ptr(&mut bh, index, new_block << self.node_ptr_shift());
                        self.store(&mut bh)?;
                        // Re-read this container; the next pass descends into
                        // the fresh child.
                    }
                    None => {
                        drop(bh);
                        self.add_new_level()?;
                        block = self.object_node_root;
                    }
                }
            }
        }
    }

    /// Frees the record for `nodeno`, clearing full bits and releasing
    /// containers that become entirely empty (the root is never released).
    pub(crate) fn delete_node(&mut self, nodeno: u32) -> CanFail<FsError> {
        let (mut bh, offset) = self.get_node(nodeno)?;
        let header: NodeContainerHeader = bh.get(0);

        let mut record: ObjectNode = bh.get(offset);
        record.data = Be32::ZERO;
        bh.put(offset, &record);

        let leaf_capacity = self.node_leaf_capacity();
        let empty = (0..leaf_capacity)
            .filter(|&i| bh.get::<ObjectNode>(Self::leaf_record_offset(i)).data.get() == 0)
            .count();

        self.store(&mut bh)?;
        let (block, nodenumber) = (bh.number, header.nodenumber.get());
        drop(bh);

        if empty == 1 {
            // The container was completely full until this delete.
            self.mark_parent_empty(block, nodenumber)
        } else if empty == leaf_capacity {
            self.free_node_container(block, nodenumber)
        } else {
            Ok(())
        }
    }

    /// Releases an all-empty container, zeroing its pointer in the parent
    /// and recursing when the parent becomes all zero as well.
    fn free_node_container(&mut self, child_block: u32, child_nodenumber: u32) -> CanFail<FsError> {
        let Some(mut bh) = self.parent_node_container(child_block, child_nodenumber)? else {
            return Ok(());
        };

        let header: NodeContainerHeader = bh.get(0);
        let entry = ((child_nodenumber - header.nodenumber.get()) / header.nodes.get()) as usize;

        let stored = Self::child_ptr(&bh, entry) >> self.node_ptr_shift();
        self.free_admin_block(stored)?;

        Self::set_child_ptr(&mut bh, entry, 0);
        self.store(&mut bh)?;

        let all_clear = (0..self.node_children()).all(|i| Self::child_ptr(&bh, i) == 0);
        if all_clear {
            let (block, nodenumber) = (bh.number, header.nodenumber.get());
            drop(bh);
            return self.free_node_container(block, nodenumber);
        }

        Ok(())
    }
}
