//! Directory enumeration and name lookup.
//!
//! Lookup goes through the directory's hash table when it has one: the name
//! hash picks a bucket, the bucket heads a chain of object nodes, and only
//! nodes whose stored `hash16` matches are worth reading the container for.
//! Directories without a table (possible for the recycled directory) fall
//! back to walking the container chain.
//!
//! The readdir cursor remembers the container and the last emitted node
//! number. When the remembered container no longer belongs to the directory
//! the scan restarts from the head of the chain and skips until it has
//! passed that node again, so entries are never emitted twice even while the
//! directory mutates between calls.

use crate::fs::asfs::name;
use crate::fs::asfs::object::{find_object_by_name, object_name, object_offsets};
use crate::fs::asfs::structs::{
    Be32, BlockId, ObjectBits, ObjectContainerHeader, ObjectDesc, ObjectNode,
    HASH_TABLE_HEADER_SIZE,
};
use crate::fs::asfs::AsfsVolume;
use crate::errors::FsError;
use crate::fs::{DirCursor, DirEntry, IOResult, ObjectType};

fn entry_kind(bits: ObjectBits) -> ObjectType {
    if bits.contains(ObjectBits::DIR) {
        ObjectType::Directory
    } else if bits.contains(ObjectBits::LINK) && !bits.contains(ObjectBits::HARDLINK) {
        ObjectType::SoftLink
    } else {
        ObjectType::File
    }
}

impl AsfsVolume {
    /// Resolves `name` in the directory behind `dir`.
    pub(crate) fn lookup(&self, dir: u32, sought: &[u8]) -> IOResult<u32> {
        let (dir_bh, dir_offset) = self.read_object_record(dir)?;
        let dir_desc: ObjectDesc = dir_bh.get(dir_offset);

        if !dir_desc.bits.contains(ObjectBits::DIR) {
            return Err(FsError::Invalid);
        }

        let hashtable = dir_desc.dir().hashtable.get();
        let first = dir_desc.dir().firstdirblock.get();
        drop(dir_bh);

        if hashtable != 0 {
            let hash_bh = self.read_checked(hashtable, BlockId::HASH_TABLE)?;
            let hashvalue = name::hash(sought, self.case_sensitive);
            let buckets = (self.block_size as usize - HASH_TABLE_HEADER_SIZE) / 4;
            let bucket = HASH_TABLE_HEADER_SIZE + 4 * (hashvalue as usize % buckets);

            let mut node = hash_bh.get::<Be32>(bucket).get();
            drop(hash_bh);

            while node != 0 {
                let (node_bh, node_offset) = self.get_node(node)?;
                let record: ObjectNode = node_bh.get(node_offset);
                drop(node_bh);

                if record.hash16.get() == hashvalue && record.data.get() != 0 {
                    let bh = self.read_checked(record.data.get(), BlockId::OBJECT_CONTAINER)?;
                    if let Some(offset) =
                        find_object_by_name(&bh.data, sought, self.case_sensitive)
                    {
                        let found: ObjectDesc = bh.get(offset);
                        if found.objectnode.get() == node {
                            return Ok(node);
                        }
                    }
                }

                node = record.next.get();
            }

            Err(FsError::NotFound)
        } else {
            let mut block = first;

            while block != 0 {
                let bh = self.read_checked(block, BlockId::OBJECT_CONTAINER)?;
                if let Some(offset) = find_object_by_name(&bh.data, sought, self.case_sensitive)
                {
                    return Ok(bh.get::<ObjectDesc>(offset).objectnode.get());
                }
                block = bh.get::<ObjectContainerHeader>(0).next.get();
            }

            Err(FsError::NotFound)
        }
    }

    /// One step of directory enumeration; see [`DirCursor`].
    pub(crate) fn readdir_step(
        &self,
        dir: u32,
        cursor: DirCursor,
    ) -> IOResult<Option<(DirEntry, DirCursor)>> {
        let (dir_bh, dir_offset) = self.read_object_record(dir)?;
        let dir_desc: ObjectDesc = dir_bh.get(dir_offset);

        if !dir_desc.bits.contains(ObjectBits::DIR) {
            return Err(FsError::Invalid);
        }

        let first = dir_desc.dir().firstdirblock.get();
        let dir_parent = dir_bh.get::<ObjectContainerHeader>(0).parent.get();
        drop(dir_bh);

        match cursor {
            DirCursor::End => Ok(None),

            DirCursor::Start => Ok(Some((
                DirEntry {
                    name: b".".to_vec(),
                    node: dir,
                    kind: ObjectType::Directory,
                },
                DirCursor::Parent,
            ))),

            DirCursor::Parent => {
                let parent = if dir_parent == 0 { dir } else { dir_parent };
                Ok(Some((
                    DirEntry {
                        name: b"..".to_vec(),
                        node: parent,
                        kind: ObjectType::Directory,
                    },
                    DirCursor::Within {
                        container: first,
                        last_node: 0,
                    },
                )))
            }

            DirCursor::Within {
                container,
                last_node,
            } => {
                if last_node == 0 {
                    // Fresh scan; the chain head may have moved since the
                    // cursor was handed out.
                    return self.scan_entries(dir, first, 0);
                }

                if self.resume_container_valid(dir, container, last_node) {
                    self.scan_entries(dir, container, last_node)
                } else {
                    self.scan_entries(dir, first, last_node)
                }
            }
        }
    }

    fn resume_container_valid(&self, dir: u32, container: u32, last_node: u32) -> bool {
        if container == 0 || !self.probe_block(container, BlockId::OBJECT_CONTAINER) {
            return false;
        }

        let Ok(bh) = self.read_checked(container, BlockId::OBJECT_CONTAINER) else {
            return false;
        };

        bh.get::<ObjectContainerHeader>(0).parent.get() == dir
            && object_offsets(&bh.data)
                .into_iter()
                .any(|offset| bh.get::<ObjectDesc>(offset).objectnode.get() == last_node)
    }

    /// Walks the chain from `start`, skipping entries until `skip_until` has
    /// been seen (0 skips nothing), and emits the next visible entry.
    fn scan_entries(
        &self,
        dir: u32,
        start: u32,
        skip_until: u32,
    ) -> IOResult<Option<(DirEntry, DirCursor)>> {
        let mut block = start;
        let mut emitting = skip_until == 0;

        while block != 0 {
            let bh = self.read_checked(block, BlockId::OBJECT_CONTAINER)?;
            if bh.get::<ObjectContainerHeader>(0).parent.get() != dir {
                break;
            }

            for offset in object_offsets(&bh.data) {
                let desc: ObjectDesc = bh.get(offset);
                let node = desc.objectnode.get();

                if !emitting {
                    if node == skip_until {
                        emitting = true;
                    }
                    continue;
                }

                if desc.bits.contains(ObjectBits::HIDDEN) {
                    continue;
                }

                let entry = DirEntry {
                    name: object_name(&bh.data, offset).to_vec(),
                    node,
                    kind: entry_kind(desc.bits),
                };
                return Ok(Some((
                    entry,
                    DirCursor::Within {
                        container: block,
                        last_node: node,
                    },
                )));
            }

            block = bh.get::<ObjectContainerHeader>(0).next.get();
        }

        Ok(None)
    }
}
