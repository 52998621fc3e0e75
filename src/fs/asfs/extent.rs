//! Extent B-tree.
//!
//! File data runs are indexed by a B-tree keyed by the run's first block
//! number. Internal containers hold `{key, child block}` pairs, leaves hold
//! [`ExtentBNode`] records whose `next`/`prev` fields additionally thread the
//! extents of one file into a doubly linked list. The `prev` of a file's
//! first extent carries the owning object node, tagged with the top bit.
//!
//! The tree root lives at the block recorded in the super block and its
//! block number never changes: growing the tree copies the root's content
//! into a fresh sibling, shrinking collapses an only child back into the
//! root block.

use alloc::vec::Vec;

use crate::errors::{CanFail, FsError};
use crate::fs::asfs::structs::{
    BNode, BTreeHeader, Be16, Be32, BlockId, ExtentBNode, ExtentPrev, BNODE_SIZE,
    BTREE_HEADER_SIZE,
};
use crate::fs::asfs::{AsfsVolume, Block};
use crate::fs::IOResult;

fn node_offset(slot: usize, nodesize: usize) -> usize {
    BTREE_HEADER_SIZE + slot * nodesize
}

/// Index of the entry with the largest key not above `key`, or 0 when `key`
/// is below every entry. The container must not be empty.
fn search_slot(bh: &Block, key: u32) -> usize {
    let header: BTreeHeader = bh.get(0);
    let nodesize = header.nodesize as usize;
    let mut slot = header.nodecount.get() as usize - 1;

    loop {
        let node: BNode = bh.get(node_offset(slot, nodesize));
        if slot == 0 || key >= node.key.get() {
            return slot;
        }
        slot -= 1;
    }
}

/// Makes room for a new entry with `key`, keeping the container sorted, and
/// returns the byte offset of the freed slot. The caller writes the record.
/// Must not be used on a full container.
fn insert_slot(bh: &mut Block, key: u32) -> usize {
    let mut header: BTreeHeader = bh.get(0);
    let nodesize = header.nodesize as usize;
    let count = header.nodecount.get() as usize;

    let mut slot = count;
    while slot > 0 {
        let node: BNode = bh.get(node_offset(slot - 1, nodesize));
        if key > node.key.get() {
            break;
        }
        let src = node_offset(slot - 1, nodesize);
        bh.data.copy_within(src..src + nodesize, src + nodesize);
        slot -= 1;
    }

    header.nodecount = Be16::new(count as u16 + 1);
    bh.put(0, &header);

    node_offset(slot, nodesize)
}

/// Removes the entry with `key`, if present, shifting the tail down.
fn remove_slot(bh: &mut Block, key: u32) {
    let mut header: BTreeHeader = bh.get(0);
    let nodesize = header.nodesize as usize;
    let count = header.nodecount.get() as usize;

    for slot in 0..count {
        let node: BNode = bh.get(node_offset(slot, nodesize));
        if node.key.get() == key {
            let src = node_offset(slot + 1, nodesize);
            let end = node_offset(count, nodesize);
            bh.data.copy_within(src..end, node_offset(slot, nodesize));

            header.nodecount = Be16::new(count as u16 - 1);
            bh.put(0, &header);
            return;
        }
    }
}

impl AsfsVolume {
    fn btree_branches(&self, nodesize: usize) -> usize {
        (self.block_size as usize - BTREE_HEADER_SIZE) / nodesize
    }

    /// Descends from the root towards `key`.
    ///
    /// Returns the container and the slot of the closest match, or `None` for
    /// the slot when the tree is completely empty.
    fn find_bnode(&self, key: u32) -> IOResult<(Block, Option<usize>)> {
        let mut block = self.extent_b_root;

        loop {
            let bh = self.read_checked(block, BlockId::BNODE_CONTAINER)?;
            let header: BTreeHeader = bh.get(0);

            if header.nodecount.get() == 0 {
                return Ok((bh, None));
            }

            let slot = search_slot(&bh, key);
            if header.isleaf != 0 {
                return Ok((bh, Some(slot)));
            }

            let node: BNode = bh.get(node_offset(slot, header.nodesize as usize));
            block = node.data.get();
        }
    }

    /// Fetches the extent record with exactly `key`.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] when no extent has this key.
    pub(crate) fn get_extent(&self, key: u32) -> IOResult<(Block, usize)> {
        let (bh, slot) = self.find_bnode(key)?;
        let slot = slot.ok_or(FsError::NotFound)?;

        let header: BTreeHeader = bh.get(0);
        let offset = node_offset(slot, header.nodesize as usize);
        let extent: ExtentBNode = bh.get(offset);

        if extent.key.get() != key {
            return Err(FsError::NotFound);
        }

        Ok((bh, offset))
    }

    /// Finds the container holding the routing entry for `child`, or `None`
    /// when `child` is the root.
    fn btree_parent(&self, child: &Block) -> IOResult<Option<Block>> {
        if self.extent_b_root == child.number {
            return Ok(None);
        }

        let child_key = child.get::<BNode>(BTREE_HEADER_SIZE).key.get();
        let mut block = self.extent_b_root;

        loop {
            let bh = self.read_checked(block, BlockId::BNODE_CONTAINER)?;
            let header: BTreeHeader = bh.get(0);

            if header.isleaf != 0 {
                // Walked to a leaf without passing the child: no parent.
                return Ok(None);
            }

            let nodesize = header.nodesize as usize;
            for slot in 0..header.nodecount.get() as usize {
                let node: BNode = bh.get(node_offset(slot, nodesize));
                if node.data.get() == child.number {
                    return Ok(Some(bh));
                }
            }

            let slot = search_slot(&bh, child_key);
            let node: BNode = bh.get(node_offset(slot, nodesize));
            block = node.data.get();
        }
    }

    /// Splits a full container 50/50, consuming the buffer. The upper half
    /// moves into a freshly allocated admin block whose first key becomes the
    /// routing key in the parent; splitting the root first copies it out into
    /// a new sibling so the root block number is preserved.
    fn split_btree_container(&mut self, bh: Block) -> CanFail<FsError> {
        let (bh, mut parent_bh) = match self.btree_parent(&bh)? {
            Some(parent_bh) => (bh, parent_bh),
            None => {
                // Growing the tree: the root's content moves into a new
                // sibling and the root block becomes an internal container
                // with that sibling as its only child.
                let sibling_block = self.alloc_admin_block()?;

                let mut sibling = Block {
                    number: sibling_block,
                    data: bh.data.clone(),
                };
                let mut header: BTreeHeader = sibling.get(0);
                header.header.ownblock = Be32::new(sibling_block);
                sibling.put(0, &header);
                self.store(&mut sibling)?;

                let root_block = bh.number;
                let mut root = self.zeroed_block(root_block, BlockId::BNODE_CONTAINER);
                let mut root_header: BTreeHeader = root.get(0);
                root_header.nodecount = Be16::new(1);
                root_header.isleaf = 0;
                root_header.nodesize = BNODE_SIZE as u8;
                root.put(0, &root_header);
                root.put(
                    BTREE_HEADER_SIZE,
                    &BNode {
                        key: Be32::ZERO,
                        data: Be32::new(sibling_block),
                    },
                );
                self.store(&mut root)?;

                (sibling, root)
            }
        };

        let parent_header: BTreeHeader = parent_bh.get(0);
        if parent_header.nodecount.get() as usize
            == self.btree_branches(parent_header.nodesize as usize)
        {
            // The parent is full as well; split it first, then find the
            // child's parent again since routing moved around.
            self.split_btree_container(parent_bh)?;
            parent_bh = self.btree_parent(&bh)?.ok_or(FsError::Io)?;
        }

        let header: BTreeHeader = bh.get(0);
        let nodesize = header.nodesize as usize;
        let branches = self.btree_branches(nodesize);
        let keep = branches / 2;
        let moved = branches - keep;

        let new_block = self.alloc_admin_block()?;
        let mut new_bh = self.zeroed_block(new_block, BlockId::BNODE_CONTAINER);

        let mut new_header: BTreeHeader = new_bh.get(0);
        new_header.nodecount = Be16::new(moved as u16);
        new_header.isleaf = header.isleaf;
        new_header.nodesize = header.nodesize;
        new_bh.put(0, &new_header);

        let src = node_offset(keep, nodesize);
        let end = node_offset(branches, nodesize);
        let upper: Vec<u8> = bh.data[src..end].to_vec();
        new_bh.data[BTREE_HEADER_SIZE..BTREE_HEADER_SIZE + upper.len()].copy_from_slice(&upper);

        let new_key = new_bh.get::<BNode>(BTREE_HEADER_SIZE).key.get();
        self.store(&mut new_bh)?;

        let mut bh = bh;
        let mut trimmed: BTreeHeader = bh.get(0);
        trimmed.nodecount = Be16::new(keep as u16);
        bh.put(0, &trimmed);
        self.store(&mut bh)?;

        let slot = insert_slot(&mut parent_bh, new_key);
        parent_bh.put(
            slot,
            &BNode {
                key: Be32::new(new_key),
                data: Be32::new(new_block),
            },
        );
        self.store(&mut parent_bh)?;

        Ok(())
    }

    /// Finds the leaf `key` belongs into and reserves a slot there, splitting
    /// containers on the way down as needed. The caller writes the record and
    /// stores the buffer.
    fn create_extent_bnode(&mut self, key: u32) -> IOResult<(Block, usize)> {
        loop {
            let (mut bh, _) = self.find_bnode(key)?;
            let header: BTreeHeader = bh.get(0);

            if (header.nodecount.get() as usize)
                < self.btree_branches(header.nodesize as usize)
            {
                let offset = insert_slot(&mut bh, key);
                return Ok((bh, offset));
            }

            self.split_btree_container(bh)?;
        }
    }

    /// Removes the entry `key` from the container and rebalances: a
    /// container that drops below half full steals from or merges with a
    /// neighbour, and an internal root with a single child collapses into
    /// the root block.
    pub(crate) fn delete_bnode(&mut self, mut bh: Block, key: u32) -> CanFail<FsError> {
        remove_slot(&mut bh, key);
        self.store(&mut bh)?;

        let header: BTreeHeader = bh.get(0);
        let nodesize = header.nodesize as usize;
        let branches = self.btree_branches(nodesize);
        let count = header.nodecount.get() as usize;

        if count >= (branches + 1) / 2 {
            return Ok(());
        }

        match self.btree_parent(&bh)? {
            Some(mut parent_bh) => {
                let parent_header: BTreeHeader = parent_bh.get(0);
                let parent_count = parent_header.nodecount.get() as usize;

                let mut own = parent_count;
                for slot in 0..parent_count {
                    let node: BNode = parent_bh.get(node_offset(slot, BNODE_SIZE));
                    if node.data.get() == bh.number {
                        own = slot;
                        break;
                    }
                }
                if own == parent_count {
                    log::error!(target: "asfs", "b-tree container {} missing from its parent", bh.number);
                    return Err(FsError::Io);
                }

                if own + 1 < parent_count {
                    let sibling_node: BNode = parent_bh.get(node_offset(own + 1, BNODE_SIZE));
                    let mut sibling =
                        self.read_checked(sibling_node.data.get(), BlockId::BNODE_CONTAINER)?;
                    let mut sibling_header: BTreeHeader = sibling.get(0);
                    let sibling_count = sibling_header.nodecount.get() as usize;

                    if sibling_count + count > branches {
                        // Steal the leading nodes of the next sibling.
                        let steal = (sibling_count + count) / 2 - count;

                        let taken: Vec<u8> = sibling.data
                            [BTREE_HEADER_SIZE..node_offset(steal, nodesize)]
                            .to_vec();
                        bh.data[node_offset(count, nodesize)
                            ..node_offset(count + steal, nodesize)]
                            .copy_from_slice(&taken);
                        let mut grown: BTreeHeader = bh.get(0);
                        grown.nodecount = Be16::new((count + steal) as u16);
                        bh.put(0, &grown);
                        self.store(&mut bh)?;

                        sibling.data.copy_within(
                            node_offset(steal, nodesize)..node_offset(sibling_count, nodesize),
                            BTREE_HEADER_SIZE,
                        );
                        sibling_header.nodecount = Be16::new((sibling_count - steal) as u16);
                        sibling.put(0, &sibling_header);
                        self.store(&mut sibling)?;

                        let mut routing: BNode = parent_bh.get(node_offset(own + 1, BNODE_SIZE));
                        routing.key = sibling.get::<BNode>(BTREE_HEADER_SIZE).key;
                        parent_bh.put(node_offset(own + 1, BNODE_SIZE), &routing);
                        self.store(&mut parent_bh)
                    } else {
                        // Merge the next sibling into this container.
                        let merged: Vec<u8> = sibling.data
                            [BTREE_HEADER_SIZE..node_offset(sibling_count, nodesize)]
                            .to_vec();
                        bh.data[node_offset(count, nodesize)
                            ..node_offset(count + sibling_count, nodesize)]
                            .copy_from_slice(&merged);
                        let mut grown: BTreeHeader = bh.get(0);
                        grown.nodecount = Be16::new((count + sibling_count) as u16);
                        bh.put(0, &grown);
                        self.store(&mut bh)?;

                        let routing_key = sibling_node.key.get();
                        let sibling_block = sibling.number;
                        drop(sibling);
                        drop(bh);

                        self.free_admin_block(sibling_block)?;
                        self.delete_bnode(parent_bh, routing_key)
                    }
                } else if own > 0 {
                    let sibling_node: BNode = parent_bh.get(node_offset(own - 1, BNODE_SIZE));
                    let mut sibling =
                        self.read_checked(sibling_node.data.get(), BlockId::BNODE_CONTAINER)?;
                    let mut sibling_header: BTreeHeader = sibling.get(0);
                    let sibling_count = sibling_header.nodecount.get() as usize;

                    if sibling_count + count > branches {
                        // Steal the trailing nodes of the previous sibling.
                        let steal = (sibling_count + count) / 2 - count;

                        bh.data.copy_within(
                            BTREE_HEADER_SIZE..node_offset(count, nodesize),
                            node_offset(steal, nodesize),
                        );
                        let taken: Vec<u8> = sibling.data[node_offset(
                            sibling_count - steal,
                            nodesize,
                        )
                            ..node_offset(sibling_count, nodesize)]
                            .to_vec();
                        bh.data[BTREE_HEADER_SIZE..node_offset(steal, nodesize)]
                            .copy_from_slice(&taken);
                        let mut grown: BTreeHeader = bh.get(0);
                        grown.nodecount = Be16::new((count + steal) as u16);
                        bh.put(0, &grown);
                        self.store(&mut bh)?;

                        sibling_header.nodecount = Be16::new((sibling_count - steal) as u16);
                        sibling.put(0, &sibling_header);
                        self.store(&mut sibling)?;

                        let mut routing: BNode = parent_bh.get(node_offset(own, BNODE_SIZE));
                        routing.key = bh.get::<BNode>(BTREE_HEADER_SIZE).key;
                        parent_bh.put(node_offset(own, BNODE_SIZE), &routing);
                        self.store(&mut parent_bh)
                    } else {
                        // Merge this container into the previous sibling.
                        let moved: Vec<u8> =
                            bh.data[BTREE_HEADER_SIZE..node_offset(count, nodesize)].to_vec();
                        sibling.data[node_offset(sibling_count, nodesize)
                            ..node_offset(sibling_count + count, nodesize)]
                            .copy_from_slice(&moved);
                        sibling_header.nodecount = Be16::new((sibling_count + count) as u16);
                        sibling.put(0, &sibling_header);
                        self.store(&mut sibling)?;

                        let routing_key: u32 =
                            parent_bh.get::<BNode>(node_offset(own, BNODE_SIZE)).key.get();
                        let own_block = bh.number;
                        drop(sibling);
                        drop(bh);

                        self.free_admin_block(own_block)?;
                        self.delete_bnode(parent_bh, routing_key)
                    }
                } else {
                    // An only child; this happens for children of the root
                    // and the root collapse below takes care of it.
                    Ok(())
                }
            }
            None => {
                // The root is allowed to run under half full. An internal
                // root with a single child collapses into the root block so
                // the root block number never changes.
                if count == 1 && header.isleaf == 0 {
                    let child_block = bh.get::<BNode>(BTREE_HEADER_SIZE).data.get();
                    let child = self.read_checked(child_block, BlockId::BNODE_CONTAINER)?;

                    let root_block = bh.number;
                    bh.data.copy_from_slice(&child.data);
                    let mut root_header: BTreeHeader = bh.get(0);
                    root_header.header.ownblock = Be32::new(root_block);
                    bh.put(0, &root_header);
                    self.store(&mut bh)?;

                    drop(child);
                    self.free_admin_block(child_block)?;
                }
                Ok(())
            }
        }
    }

    /// Deletes the extent at `key` and every extent linked after it, freeing
    /// their data runs. Does nothing when `key` is zero; the `next` field of
    /// an extent pointing at `key` is the caller's concern.
    pub(crate) fn delete_extents(&mut self, key: u32) -> CanFail<FsError> {
        let mut key = key;

        while key != 0 {
            let (bh, offset) = self.get_extent(key)?;
            let extent: ExtentBNode = bh.get(offset);

            let next = extent.next.get();
            self.free_space(extent.key.get(), u32::from(extent.blocks.get()))?;
            self.delete_bnode(bh, extent.key.get())?;

            key = next;
        }

        Ok(())
    }

    /// Appends the run `[newspace, newspace + blocks)` to the file owning
    /// the extent chain ending at `*last` (0 when the file has no chain
    /// yet). `*last` tracks the key of the chain tail across calls.
    pub(crate) fn add_blocks(
        &mut self,
        blocks: u16,
        newspace: u32,
        objectnode: u32,
        last: &mut u32,
    ) -> CanFail<FsError> {
        if *last != 0 {
            let (mut bh, offset) = self.get_extent(*last)?;
            let mut extent: ExtentBNode = bh.get(offset);

            if extent.key.get() + u32::from(extent.blocks.get()) == newspace
                && u32::from(extent.blocks.get()) + u32::from(blocks) < 65536
            {
                // The new run directly follows the tail extent: grow it.
                extent.blocks = Be16::new(extent.blocks.get() + blocks);
                bh.put(offset, &extent);
                return self.store(&mut bh);
            }

            extent.next = Be32::new(newspace);
            bh.put(offset, &extent);
            self.store(&mut bh)?;
            drop(bh);

            let (mut new_bh, new_offset) = self.create_extent_bnode(newspace)?;
            new_bh.put(
                new_offset,
                &ExtentBNode {
                    key: Be32::new(newspace),
                    next: Be32::ZERO,
                    prev: Be32::new(*last),
                    blocks: Be16::new(blocks),
                    pad: [0; 2],
                },
            );
            self.store(&mut new_bh)?;
            *last = newspace;
        } else {
            let (mut new_bh, new_offset) = self.create_extent_bnode(newspace)?;
            new_bh.put(
                new_offset,
                &ExtentBNode {
                    key: Be32::new(newspace),
                    next: Be32::ZERO,
                    prev: Be32::new(ExtentPrev::Parent(objectnode).encode()),
                    blocks: Be16::new(blocks),
                    pad: [0; 2],
                },
            );
            self.store(&mut new_bh)?;
            *last = newspace;
        }

        self.roving_block_ptr = (newspace + u32::from(blocks)) % self.total_blocks;
        let roving = self.roving_block_ptr;
        self.update_root_info(|info| {
            info.rovingpointer = Be32::new(roving);
            info.lastallocatedextentnode = Be32::new(newspace);
            info.lastallocatedblock = Be32::new(newspace);
        })
    }
}
