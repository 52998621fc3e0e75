//! Fresh-volume initialisation.
//!
//! Lays down the minimal valid structure set: the root block and its mirror,
//! the root object container holding the root and recycled directories with
//! the root info trailer, an empty extent B-tree root, the object-node tree
//! root seeded with nodes 1 and 2, one admin-space container covering the
//! first 32-block region, the root directory's hash table and the bitmap.
//!
//! The initial admin region spans blocks 1..=32 (an admin-space record with
//! `space == 0` would read as unused) and is marked used in the bitmap
//! wholesale, as are the root block and its mirror at the end of the
//! volume.

use alloc::vec;

use crate::errors::{CanFail, FsError};
use crate::fs::asfs::bitfuncs::bmset;
use crate::fs::asfs::structs::{
    AdminSpace, AdminSpaceContainerHeader, BTreeHeader, Be16, Be32, BlockHeader, BlockId, DirInfo,
    DiskDate, ObjectBits, ObjectContainerHeader, ObjectDesc, ObjectNode, Protection, RootBlock,
    RootInfo, ADMIN_SPACE_BLOCKS, ADMIN_SPACE_CONTAINER_HEADER_SIZE, BITMAP_HEADER_SIZE,
    EXTENT_BNODE_SIZE, HashTableHeader, NODE_CONTAINER_HEADER_SIZE, NODE_STRUCT_SIZE,
    OBJECT_CONTAINER_HEADER_SIZE, OBJECT_DESC_SIZE, ROOT_INFO_SIZE, STRUCTURE_VERSION,
};
use crate::fs::asfs::calc_checksum;
use crate::io::BlockDevice;

const ROOT_CONTAINER: u32 = 1;
const EXTENT_ROOT: u32 = 2;
// block 3 stays empty: a transaction-failure marker lands at
// rootobjectcontainer + 2
const NODE_ROOT: u32 = 4;
const ADMIN_CONTAINER: u32 = 5;
const ROOT_HASHTABLE: u32 = 6;
const FIRST_BITMAP: u32 = 7;

fn write_block(
    device: &mut dyn BlockDevice,
    block_size: u32,
    n: u32,
    data: &mut [u8],
) -> CanFail<FsError> {
    let checksum = calc_checksum(data);
    data[4..8].copy_from_slice(&checksum.to_be_bytes());

    device.write_at(u64::from(n) * u64::from(block_size), data)?;
    Ok(())
}

fn header(id: BlockId, n: u32) -> BlockHeader {
    BlockHeader {
        id,
        checksum: Be32::ZERO,
        ownblock: Be32::new(n),
    }
}

fn put<T: bytemuck::Pod>(data: &mut [u8], offset: usize, value: &T) {
    data[offset..offset + core::mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(value));
}

/// Initialises an empty volume on `device`.
///
/// # Errors
///
/// [`FsError::Invalid`] when the block size is not a power of two of at
/// least 512 bytes, the device holds fewer than 64 blocks, or the volume is
/// too large for its bitmap to fit the initial admin region.
pub fn format(device: &mut dyn BlockDevice, block_size: u32, date: DiskDate) -> CanFail<FsError> {
    if !block_size.is_power_of_two() || block_size < 512 {
        return Err(FsError::Invalid);
    }

    let bs = block_size as usize;
    let total_blocks = u32::try_from(device.size() / u64::from(block_size))
        .unwrap_or(u32::MAX);

    if total_blocks < 64 {
        return Err(FsError::Invalid);
    }

    let blocks_in_bitmap = (block_size - BITMAP_HEADER_SIZE as u32) * 8;
    let bitmap_blocks = (total_blocks + blocks_in_bitmap - 1) / blocks_in_bitmap;

    // Structure blocks inside the admin region, counted from block 1.
    let used = FIRST_BITMAP - 1 + bitmap_blocks;

    if used > ADMIN_SPACE_BLOCKS {
        log::error!(
            target: "asfs",
            "volume needs {bitmap_blocks} bitmap blocks, too many for the initial admin region"
        );
        return Err(FsError::Invalid);
    }

    // Reserved: the root block, the 32-block admin region and the mirror.
    let free_blocks = total_blocks - 1 - ADMIN_SPACE_BLOCKS - 1;

    // Root block and its mirror.
    let mut root = RootBlock {
        header: header(BlockId::ROOT, 0),
        version: Be16::new(STRUCTURE_VERSION),
        sequencenumber: Be16::new(0),
        datecreated: Be32::new(date.0),
        bits: 0,
        pad1: 0,
        pad2: [0; 2],
        reserved1: [Be32::ZERO; 2],
        firstbyteh: Be32::ZERO,
        firstbyte: Be32::ZERO,
        lastbyteh: Be32::new((u64::from(total_blocks) * u64::from(block_size) >> 32) as u32),
        lastbyte: Be32::new((u64::from(total_blocks) * u64::from(block_size)) as u32),
        totalblocks: Be32::new(total_blocks),
        blocksize: Be32::new(block_size),
        reserved2: [Be32::ZERO; 2],
        reserved3: [Be32::ZERO; 8],
        bitmapbase: Be32::new(FIRST_BITMAP),
        adminspacecontainer: Be32::new(ADMIN_CONTAINER),
        rootobjectcontainer: Be32::new(ROOT_CONTAINER),
        extentbnoderoot: Be32::new(EXTENT_ROOT),
        objectnoderoot: Be32::new(NODE_ROOT),
        reserved4: [Be32::ZERO; 3],
    };

    let mut data = vec![0u8; bs];
    put(&mut data, 0, &root);
    write_block(device, block_size, 0, &mut data)?;

    root.header.ownblock = Be32::new(total_blocks - 1);
    data.fill(0);
    put(&mut data, 0, &root);
    write_block(device, block_size, total_blocks - 1, &mut data)?;

    // Root object container: the root directory, the recycled directory and
    // the root info trailer.
    data.fill(0);
    put(
        &mut data,
        0,
        &ObjectContainerHeader {
            header: header(BlockId::OBJECT_CONTAINER, ROOT_CONTAINER),
            parent: Be32::ZERO,
            next: Be32::ZERO,
            previous: Be32::ZERO,
        },
    );

    let protection = Protection::DELETE | Protection::EXECUTE | Protection::WRITE | Protection::READ;

    let mut root_dir = ObjectDesc::default();
    root_dir.objectnode = Be32::new(1);
    root_dir.protection = Be32::new(protection.0);
    root_dir.datemodified = Be32::new(date.0);
    root_dir.bits = ObjectBits::DIR;
    root_dir.set_dir(DirInfo {
        hashtable: Be32::new(ROOT_HASHTABLE),
        firstdirblock: Be32::ZERO,
    });
    put(&mut data, OBJECT_CONTAINER_HEADER_SIZE, &root_dir);
    // empty name, empty comment, pad: next record lands at the next even
    // offset past the two NULs
    let recycled_offset = OBJECT_CONTAINER_HEADER_SIZE + OBJECT_DESC_SIZE + 2 + 1;

    let mut recycled = ObjectDesc::default();
    recycled.objectnode = Be32::new(2);
    recycled.protection = Be32::new(protection.0);
    recycled.datemodified = Be32::new(date.0);
    recycled.bits = ObjectBits::DIR | ObjectBits::HIDDEN;
    recycled.set_dir(DirInfo {
        hashtable: Be32::ZERO,
        firstdirblock: Be32::ZERO,
    });
    put(&mut data, recycled_offset, &recycled);
    let name_offset = recycled_offset + OBJECT_DESC_SIZE;
    data[name_offset..name_offset + 9].copy_from_slice(b".recycled");

    put(
        &mut data,
        bs - ROOT_INFO_SIZE,
        &RootInfo {
            deletedblocks: Be32::ZERO,
            deletedfiles: Be32::ZERO,
            freeblocks: Be32::new(free_blocks),
            datecreated: Be32::new(date.0),
            lastallocatedblock: Be32::ZERO,
            lastallocatedadminspace: Be32::new(ADMIN_CONTAINER),
            lastallocatedextentnode: Be32::ZERO,
            lastallocatedobjectnode: Be32::new(2),
            rovingpointer: Be32::ZERO,
        },
    );
    write_block(device, block_size, ROOT_CONTAINER, &mut data)?;

    // Empty extent B-tree root: a leaf with no entries.
    data.fill(0);
    put(
        &mut data,
        0,
        &BTreeHeader {
            header: header(BlockId::BNODE_CONTAINER, EXTENT_ROOT),
            nodecount: Be16::new(0),
            isleaf: 1,
            nodesize: EXTENT_BNODE_SIZE as u8,
        },
    );
    write_block(device, block_size, EXTENT_ROOT, &mut data)?;

    // Object-node tree root: a leaf covering node numbers from 1, with the
    // root and recycled directories already present.
    data.fill(0);
    put(&mut data, 0, &header(BlockId::NODE_CONTAINER, NODE_ROOT));
    put(&mut data, 12, &Be32::new(1)); // nodenumber
    put(&mut data, 16, &Be32::new(1)); // nodes
    for slot in 0..2 {
        put(
            &mut data,
            NODE_CONTAINER_HEADER_SIZE + slot * NODE_STRUCT_SIZE,
            &ObjectNode {
                data: Be32::new(ROOT_CONTAINER),
                next: Be32::ZERO,
                hash16: Be16::new(0),
            },
        );
    }
    write_block(device, block_size, NODE_ROOT, &mut data)?;

    // Admin-space container: one region covering blocks 1..=32 with the
    // structure blocks above marked used.
    data.fill(0);
    put(
        &mut data,
        0,
        &AdminSpaceContainerHeader {
            header: header(BlockId::ADMIN_SPACE_CONTAINER, ADMIN_CONTAINER),
            next: Be32::ZERO,
            previous: Be32::ZERO,
            bits: 32,
            pad1: 0,
            pad2: [0; 2],
        },
    );
    put(
        &mut data,
        ADMIN_SPACE_CONTAINER_HEADER_SIZE,
        &AdminSpace {
            space: Be32::new(1),
            bits: Be32::new(u32::MAX << (32 - used)),
        },
    );
    write_block(device, block_size, ADMIN_CONTAINER, &mut data)?;

    // Root directory hash table, all buckets empty.
    data.fill(0);
    put(
        &mut data,
        0,
        &HashTableHeader {
            header: header(BlockId::HASH_TABLE, ROOT_HASHTABLE),
            parent: Be32::new(1),
        },
    );
    write_block(device, block_size, ROOT_HASHTABLE, &mut data)?;

    // Bitmap: everything free except the initial admin region and the
    // mirror root block.
    let longs = (bs - BITMAP_HEADER_SIZE) >> 2;
    for i in 0..bitmap_blocks {
        data.fill(0);
        put(&mut data, 0, &header(BlockId::BITMAP, FIRST_BITMAP + i));

        let covered_start = i * blocks_in_bitmap;
        let free_start = covered_start.max(1 + ADMIN_SPACE_BLOCKS);
        let free_end = (covered_start + blocks_in_bitmap).min(total_blocks - 1);

        if free_end > free_start {
            bmset(
                &mut data[BITMAP_HEADER_SIZE..],
                longs,
                (free_start - covered_start) as usize,
                (free_end - free_start) as usize,
            );
        }

        write_block(device, block_size, FIRST_BITMAP + i, &mut data)?;
    }

    log::info!(
        target: "asfs",
        "formatted volume: {total_blocks} blocks of {block_size} bytes, {free_blocks} free"
    );

    Ok(())
}
