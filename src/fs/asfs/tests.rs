//! Whole-volume scenario tests.
//!
//! Every test builds a fresh volume on a [`MemDevice`], mounts it and drives
//! the public API, then checks the on-disk invariants directly through the
//! engine internals: sum-to-zero checksums, free-count against bitmap
//! population, B-tree ordering, object-node tree full bits and hash-chain
//! reachability.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;

use crate::errors::FsError;
use crate::fs::asfs::structs::{
    BTreeHeader, Be32, BlockId, ExtentBNode, NodeContainerHeader, ObjectDesc, ObjectNode,
    BITMAP_HEADER_SIZE, BTREE_HEADER_SIZE, HASH_TABLE_HEADER_SIZE, NODE_CONTAINER_HEADER_SIZE,
    NODE_STRUCT_SIZE, RECYCLED_NODE, ROOT_NODE,
};
use crate::fs::asfs::{format, Asfs, AsfsVolume, DiskDate, MountOptions};
use crate::fs::{DirCursor, DirEntry, ObjectType};
use crate::io::{BlockDevice, MemDevice};

const BS: u32 = 512;

fn new_fs(total_blocks: u32) -> (Asfs, MemDevice) {
    let mut dev = MemDevice::new((total_blocks * BS) as usize);
    format(&mut dev, BS, DiskDate(1000)).unwrap();

    let fs = Asfs::mount(Box::new(dev.clone()), MountOptions::default()).unwrap();
    (fs, dev)
}

fn date() -> DiskDate {
    DiskDate(2000)
}

fn mkfile(fs: &Asfs, dir: u32, name: &[u8]) -> u32 {
    fs.create(dir, name, ObjectType::File, 0o644, date(), None)
        .unwrap()
}

fn mkdir(fs: &Asfs, dir: u32, name: &[u8]) -> u32 {
    fs.create(dir, name, ObjectType::Directory, 0o755, date(), None)
        .unwrap()
}

fn read_all(fs: &Asfs, dir: u32) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    let mut cursor = DirCursor::Start;

    while let Some((entry, next)) = fs.readdir(dir, cursor).unwrap() {
        entries.push(entry);
        cursor = next;
    }
    entries
}

fn bitmap_popcount(vol: &AsfsVolume) -> u32 {
    let mut count = 0;

    for i in 0..vol.bitmap_blocks {
        let bh = vol
            .read_checked(vol.bitmap_base + i, BlockId::BITMAP)
            .unwrap();
        for w in bh.data[BITMAP_HEADER_SIZE..].chunks_exact(4) {
            count += u32::from_be_bytes([w[0], w[1], w[2], w[3]]).count_ones();
        }
    }
    count
}

fn assert_free_matches_bitmap(fs: &Asfs) {
    let vol = fs.0.lock();
    assert_eq!(vol.free_blocks, bitmap_popcount(&vol));
    assert_eq!(vol.free_blocks, vol.root_info().unwrap().freeblocks.get());
}

/// Property: all big-endian words of a stored block, seeded with 1, sum to 0.
fn assert_sums_to_zero(dev: &MemDevice, n: u32) {
    dev.with_bytes(|bytes| {
        let block = &bytes[(n * BS) as usize..((n + 1) * BS) as usize];
        let mut sum: u32 = 1;
        for w in block.chunks_exact(4) {
            sum = sum.wrapping_add(u32::from_be_bytes([w[0], w[1], w[2], w[3]]));
        }
        assert_eq!(sum, 0, "block {n} does not sum to zero");
    });
}

fn extent_chain(vol: &AsfsVolume, first: u32) -> Vec<ExtentBNode> {
    let mut chain = Vec::new();
    let mut key = first;

    while key != 0 {
        let (bh, offset) = vol.get_extent(key).unwrap();
        let extent: ExtentBNode = bh.get(offset);
        key = extent.next.get();
        chain.push(extent);
    }
    chain
}

/// Checks key ordering and parent routing keys over the whole extent B-tree.
/// Routing keys are lower bounds: splits write the child's exact first key,
/// but the root keeps a zero sentinel for its first child and deletions may
/// leave a routing key below the child's current first key.
fn check_btree(vol: &AsfsVolume, block: u32, routing: Option<u32>) {
    let bh = vol.read_checked(block, BlockId::BNODE_CONTAINER).unwrap();
    let header: BTreeHeader = bh.get(0);
    let nodesize = header.nodesize as usize;
    let count = header.nodecount.get() as usize;

    let mut previous: Option<u32> = None;
    for slot in 0..count {
        let key = bh
            .get::<Be32>(BTREE_HEADER_SIZE + slot * nodesize)
            .get();
        if let Some(p) = previous {
            assert!(p <= key, "keys out of order in container {block}");
        }
        previous = Some(key);

        if slot == 0 {
            if let Some(routing_key) = routing {
                assert!(
                    routing_key <= key,
                    "routing key above first key of container {block}"
                );
            }
        }

        if header.isleaf == 0 {
            let child = bh
                .get::<Be32>(BTREE_HEADER_SIZE + slot * nodesize + 4)
                .get();
            check_btree(vol, child, Some(key));
        }
    }
}

/// Checks that every internal full bit matches the actual fullness of its
/// subtree. Returns whether the container at `block` is full.
fn check_node_tree(vol: &AsfsVolume, block: u32) -> bool {
    let bh = vol.read_checked(block, BlockId::NODE_CONTAINER).unwrap();
    let header: NodeContainerHeader = bh.get(0);

    if header.nodes.get() == 1 {
        let capacity = (BS as usize - NODE_CONTAINER_HEADER_SIZE) / NODE_STRUCT_SIZE;
        return (0..capacity).all(|i| {
            bh.get::<ObjectNode>(NODE_CONTAINER_HEADER_SIZE + i * NODE_STRUCT_SIZE)
                .data
                .get()
                != 0
        });
    }

    let children = (BS as usize - NODE_CONTAINER_HEADER_SIZE) / 4;
    let shift = BS.trailing_zeros() - 5;
    let mut full = true;

    for i in 0..children {
        let raw = bh.get::<Be32>(NODE_CONTAINER_HEADER_SIZE + i * 4).get();
        if raw == 0 {
            full = false;
            continue;
        }

        let child_full = check_node_tree(vol, raw >> shift);
        assert_eq!(
            raw & 1 != 0,
            child_full,
            "full bit of slot {i} in container {block} is wrong"
        );
        full &= child_full;
    }
    full
}

/// Walks a directory's hash chain for `name` and asserts the object is
/// reachable and the chain terminates.
fn assert_hash_reachable(vol: &AsfsVolume, dir: u32, name: &[u8]) {
    let (dir_bh, dir_offset) = vol.read_object_record(dir).unwrap();
    let hashtable = dir_bh.get::<ObjectDesc>(dir_offset).dir().hashtable.get();
    assert_ne!(hashtable, 0, "directory {dir} has no hash table");

    let hash_bh = vol.read_checked(hashtable, BlockId::HASH_TABLE).unwrap();
    let hashvalue = crate::fs::asfs::name::hash(name, vol.case_sensitive);
    let buckets = (BS as usize - HASH_TABLE_HEADER_SIZE) / 4;
    let bucket = HASH_TABLE_HEADER_SIZE + 4 * (hashvalue as usize % buckets);

    let mut node = hash_bh.get::<Be32>(bucket).get();
    let mut found = false;
    let mut steps = 0;

    while node != 0 {
        steps += 1;
        assert!(steps < 10_000, "hash chain does not terminate");

        let (node_bh, node_offset) = vol.get_node(node).unwrap();
        let record: ObjectNode = node_bh.get(node_offset);

        if record.hash16.get() == hashvalue {
            let bh = vol
                .read_checked(record.data.get(), BlockId::OBJECT_CONTAINER)
                .unwrap();
            if crate::fs::asfs::object::find_object_by_name(&bh.data, name, vol.case_sensitive)
                .is_some()
            {
                found = true;
            }
        }

        node = record.next.get();
    }

    assert!(found, "name not reachable through the hash table");
}

#[test]
fn fresh_mount_statfs() {
    let (fs, _dev) = new_fs(1024);
    let stat = fs.statfs();

    assert_eq!(stat.total_blocks, 1024);
    assert_eq!(stat.block_size, 512);
    assert_eq!(stat.max_name_len, 105);
    // root block, the 32-block admin region and the mirror are reserved
    assert_eq!(stat.free_blocks, 1024 - 34);
    assert_free_matches_bitmap(&fs);
}

#[test]
fn format_blocks_sum_to_zero() {
    let (fs, dev) = new_fs(1024);

    for n in [0u32, 1, 2, 4, 5, 6, 7, 1023] {
        assert_sums_to_zero(&dev, n);
    }
    drop(fs);
}

#[test]
fn create_lookup_case_folding() {
    let (fs, _dev) = new_fs(1024);

    let node = mkfile(&fs, ROOT_NODE, b"hello.txt");
    assert_eq!(fs.lookup(ROOT_NODE, b"hello.txt").unwrap(), node);
    assert_eq!(fs.lookup(ROOT_NODE, b"HELLO.TXT").unwrap(), node);
    assert_eq!(fs.lookup(ROOT_NODE, b"other"), Err(FsError::NotFound));

    let info = fs.read_object(node).unwrap();
    assert_eq!(info.kind, ObjectType::File);
    assert_eq!(info.name, b"hello.txt".to_vec());
    assert_eq!(info.size, 0);
    assert_eq!(info.date_modified, date());
    // the fixed AmigaDOS set: READ|WRITE|EXECUTE|DELETE, whatever the mode
    assert_eq!(info.protection, 0b1111);
    // presentation follows the mount-time triple (default 0644)
    assert_eq!(info.mode, 0o644);

    // creating the same name again must fail
    assert_eq!(
        fs.create(ROOT_NODE, b"Hello.TXT", ObjectType::File, 0o644, date(), None),
        Err(FsError::Invalid)
    );
}

#[test]
fn tiny_file_write_read() {
    let (fs, dev) = new_fs(1024);
    let node = mkfile(&fs, ROOT_NODE, b"hello");

    let phys = fs.get_block(node, 0, true).unwrap();
    // growth is chunked
    assert_eq!(fs.statfs().free_blocks, 990 - 16);

    dev.with_bytes_mut(|bytes| {
        bytes[(phys * BS) as usize..(phys * BS) as usize + 11].copy_from_slice(b"hello world");
    });

    fs.truncate(node, 11).unwrap();
    assert_eq!(fs.statfs().free_blocks, 990 - 1);

    let info = fs.read_object(node).unwrap();
    assert_eq!(info.size, 11);

    let mapped = fs.get_block(node, 0, false).unwrap();
    assert_eq!(mapped, phys);
    dev.with_bytes(|bytes| {
        assert_eq!(&bytes[(phys * BS) as usize..(phys * BS) as usize + 11], b"hello world");
    });

    {
        let vol = fs.0.lock();
        let chain = extent_chain(&vol, info.first_extent);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].blocks.get(), 1);
    }

    assert_free_matches_bitmap(&fs);
}

#[test]
fn readdir_emits_dots_and_entries() {
    let (fs, _dev) = new_fs(1024);

    mkfile(&fs, ROOT_NODE, b"a");
    mkfile(&fs, ROOT_NODE, b"b");
    let sub = mkdir(&fs, ROOT_NODE, b"sub");
    fs.create(ROOT_NODE, b"ln", ObjectType::SoftLink, 0o777, date(), Some(b"a"))
        .unwrap();

    let entries = read_all(&fs, ROOT_NODE);
    assert_eq!(entries.len(), 6);
    assert_eq!(entries[0].name, b".".to_vec());
    assert_eq!(entries[0].node, ROOT_NODE);
    assert_eq!(entries[1].name, b"..".to_vec());
    assert_eq!(entries[1].node, ROOT_NODE);

    let names: Vec<_> = entries[2..].iter().map(|e| e.name.clone()).collect();
    assert!(names.contains(&b"a".to_vec()));
    assert!(names.contains(&b"sub".to_vec()));

    let kind_of = |n: &[u8]| {
        entries
            .iter()
            .find(|e| e.name == n)
            .map(|e| e.kind)
            .unwrap()
    };
    assert_eq!(kind_of(b"sub"), ObjectType::Directory);
    assert_eq!(kind_of(b"ln"), ObjectType::SoftLink);
    assert_eq!(kind_of(b"a"), ObjectType::File);

    // directories gain execute bits from the mount-time mode, links are 0777
    assert_eq!(fs.read_object(sub).unwrap().mode, 0o755);
    let ln = fs.lookup(ROOT_NODE, b"ln").unwrap();
    assert_eq!(fs.read_object(ln).unwrap().mode, 0o777);

    // an empty subdirectory lists only the dots
    assert_eq!(read_all(&fs, sub).len(), 2);
}

#[test]
fn directory_overflow_and_hash_path() {
    let (fs, _dev) = new_fs(4096);
    let dir = mkdir(&fs, ROOT_NODE, b"big");

    for i in 0..120u32 {
        mkfile(&fs, dir, format!("f{i:03}").as_bytes());
    }

    // the chain must have overflowed into several containers
    let containers = {
        let vol = fs.0.lock();
        let (bh, offset) = vol.read_object_record(dir).unwrap();
        let mut block = bh.get::<ObjectDesc>(offset).dir().firstdirblock.get();
        let mut count = 0;

        while block != 0 {
            let cbh = vol.read_checked(block, BlockId::OBJECT_CONTAINER).unwrap();
            count += 1;
            block = cbh
                .get::<crate::fs::asfs::structs::ObjectContainerHeader>(0)
                .next
                .get();
        }
        count
    };
    assert!(containers >= 2, "expected an overflowing chain, got {containers}");

    for i in 0..120u32 {
        let name = format!("f{i:03}");
        assert!(fs.lookup(dir, name.as_bytes()).is_ok(), "missing {name}");
    }

    assert_eq!(read_all(&fs, dir).len(), 122);

    {
        let vol = fs.0.lock();
        assert_hash_reachable(&vol, dir, b"f037");
        assert_hash_reachable(&vol, dir, b"f119");
        check_node_tree(&vol, vol.object_node_root);
    }
    assert_free_matches_bitmap(&fs);
}

#[test]
fn rename_across_directories_keeps_node() {
    let (fs, _dev) = new_fs(1024);

    let a = mkdir(&fs, ROOT_NODE, b"a");
    let b = mkdir(&fs, ROOT_NODE, b"b");
    let f = mkfile(&fs, a, b"f");

    fs.rename(a, b"f", b, b"g").unwrap();

    assert_eq!(fs.lookup(a, b"f"), Err(FsError::NotFound));
    assert_eq!(fs.lookup(b, b"g").unwrap(), f);
    assert_eq!(fs.read_object(f).unwrap().parent, b);

    let vol = fs.0.lock();
    check_node_tree(&vol, vol.object_node_root);
    assert_hash_reachable(&vol, b, b"g");
}

#[test]
fn rename_overwrites_destination() {
    let (fs, _dev) = new_fs(1024);

    let x = mkfile(&fs, ROOT_NODE, b"x");
    let y = mkfile(&fs, ROOT_NODE, b"y");
    assert_ne!(x, y);

    fs.rename(ROOT_NODE, b"x", ROOT_NODE, b"y").unwrap();

    assert_eq!(fs.lookup(ROOT_NODE, b"x"), Err(FsError::NotFound));
    assert_eq!(fs.lookup(ROOT_NODE, b"y").unwrap(), x);
    assert_free_matches_bitmap(&fs);
}

#[test]
fn name_validation_rejects_and_leaves_volume_alone() {
    let (fs, _dev) = new_fs(1024);
    let free = fs.statfs().free_blocks;

    for name in [
        b"bad:name".to_vec(),
        b"ctl\x01".to_vec(),
        b"\x7f".to_vec(),
        b"\x9f".to_vec(),
        Vec::new(),
        vec_of(b'x', 106),
    ] {
        assert_eq!(
            fs.create(ROOT_NODE, &name, ObjectType::File, 0o644, date(), None),
            Err(FsError::Invalid),
            "name {name:?} should be rejected"
        );
    }

    // 105 bytes is still fine
    mkfile(&fs, ROOT_NODE, &vec_of(b'x', 105));

    assert_eq!(fs.statfs().free_blocks, free);
    assert_free_matches_bitmap(&fs);
}

fn vec_of(c: u8, len: usize) -> Vec<u8> {
    core::iter::repeat(c).take(len).collect()
}

#[test]
fn rmdir_semantics() {
    let (fs, _dev) = new_fs(1024);

    let d = mkdir(&fs, ROOT_NODE, b"d");
    mkfile(&fs, d, b"f");
    mkfile(&fs, ROOT_NODE, b"plain");

    assert_eq!(fs.rmdir(ROOT_NODE, b"d"), Err(FsError::NotEmpty));
    assert_eq!(fs.rmdir(ROOT_NODE, b"plain"), Err(FsError::Invalid));
    assert_eq!(fs.unlink(ROOT_NODE, b"d"), Err(FsError::Invalid));

    fs.unlink(d, b"f").unwrap();
    fs.rmdir(ROOT_NODE, b"d").unwrap();
    assert_eq!(fs.lookup(ROOT_NODE, b"d"), Err(FsError::NotFound));
    assert_free_matches_bitmap(&fs);
}

#[test]
fn create_delete_restores_volume() {
    let (fs, dev) = new_fs(1024);

    // warm up so lazily created structures exist before the snapshot
    mkfile(&fs, ROOT_NODE, b"warm");
    fs.unlink(ROOT_NODE, b"warm").unwrap();

    let free_before = fs.statfs().free_blocks;
    let bitmap_before: Vec<u8> = dev.with_bytes(|bytes| {
        bytes[(7 * BS) as usize..(8 * BS) as usize].to_vec()
    });

    let node = mkfile(&fs, ROOT_NODE, b"warm");
    fs.get_block(node, 0, true).unwrap();
    fs.truncate(node, 100).unwrap();
    fs.unlink(ROOT_NODE, b"warm").unwrap();

    assert_eq!(fs.statfs().free_blocks, free_before);
    let bitmap_after: Vec<u8> =
        dev.with_bytes(|bytes| bytes[(7 * BS) as usize..(8 * BS) as usize].to_vec());
    assert_eq!(bitmap_before, bitmap_after);
    assert_eq!(fs.lookup(ROOT_NODE, b"warm"), Err(FsError::NotFound));
    assert_free_matches_bitmap(&fs);
}

#[test]
fn extent_growth_stays_ordered() {
    let (fs, _dev) = new_fs(8192);

    let a = mkfile(&fs, ROOT_NODE, b"a");
    let b = mkfile(&fs, ROOT_NODE, b"b");

    // interleave growth so the two files cannot extend in place
    for i in 0..40u32 {
        fs.get_block(a, i * 16, true).unwrap();
        fs.get_block(b, i * 16, true).unwrap();
    }

    let vol = fs.0.lock();
    let (bh, offset) = vol.read_object_record(a).unwrap();
    let first = bh.get::<ObjectDesc>(offset).file().data.get();
    drop(bh);

    let chain = extent_chain(&vol, first);
    assert_eq!(chain.len(), 40);
    for pair in chain.windows(2) {
        assert!(
            pair[0].key.get() + u32::from(pair[0].blocks.get()) <= pair[1].key.get(),
            "extents overlap or are out of order"
        );
    }

    check_btree(&vol, vol.extent_b_root, None);
    drop(vol);
    assert_free_matches_bitmap(&fs);
}

#[test]
fn truncate_to_zero_collapses_tree() {
    let (fs, _dev) = new_fs(8192);

    let a = mkfile(&fs, ROOT_NODE, b"a");
    let b = mkfile(&fs, ROOT_NODE, b"b");

    for i in 0..40u32 {
        fs.get_block(a, i * 16, true).unwrap();
        fs.get_block(b, i * 16, true).unwrap();
    }

    fs.truncate(a, 0).unwrap();
    assert_eq!(fs.read_object(a).unwrap().first_extent, 0);

    fs.truncate(b, 0).unwrap();
    assert_eq!(fs.read_object(b).unwrap().first_extent, 0);

    let vol = fs.0.lock();
    check_btree(&vol, vol.extent_b_root, None);
    let header: BTreeHeader = vol
        .read_checked(vol.extent_b_root, BlockId::BNODE_CONTAINER)
        .unwrap()
        .get(0);
    assert_eq!(header.nodecount.get(), 0);
    assert_eq!(header.isleaf, 1);
    drop(vol);

    assert_free_matches_bitmap(&fs);
}

#[test]
fn truncate_is_idempotent() {
    let (fs, _dev) = new_fs(2048);
    let node = mkfile(&fs, ROOT_NODE, b"f");

    fs.get_block(node, 20, true).unwrap();
    fs.truncate(node, 600).unwrap();
    let free = fs.statfs().free_blocks;
    let size = fs.read_object(node).unwrap().size;

    fs.truncate(node, 600).unwrap();
    assert_eq!(fs.statfs().free_blocks, free);
    assert_eq!(fs.read_object(node).unwrap().size, size);

    // growing through truncate is a no-op
    fs.truncate(node, 100_000).unwrap();
    assert_eq!(fs.read_object(node).unwrap().size, size);
    assert_free_matches_bitmap(&fs);
}

#[test]
fn get_block_read_past_end_fails() {
    let (fs, _dev) = new_fs(1024);
    let node = mkfile(&fs, ROOT_NODE, b"f");

    assert_eq!(fs.get_block(node, 0, false), Err(FsError::Io));

    fs.get_block(node, 0, true).unwrap();
    assert_eq!(fs.get_block(node, 16, false), Err(FsError::Io));
}

#[test]
fn symlink_roundtrip() {
    let (fs, _dev) = new_fs(1024);

    let node = fs
        .create(
            ROOT_NODE,
            b"link",
            ObjectType::SoftLink,
            0o777,
            date(),
            Some(b"work:src/main.c"),
        )
        .unwrap();

    assert_eq!(fs.read_object(node).unwrap().kind, ObjectType::SoftLink);
    assert_eq!(fs.read_link(node).unwrap(), b"work:src/main.c".to_vec());

    fs.write_link(node, b"other:path").unwrap();
    assert_eq!(fs.read_link(node).unwrap(), b"other:path".to_vec());

    fs.unlink(ROOT_NODE, b"link").unwrap();
    assert_free_matches_bitmap(&fs);
}

#[test]
fn recycled_directory_accounting() {
    let (fs, _dev) = new_fs(2048);

    let node = mkfile(&fs, ROOT_NODE, b"junk");
    fs.get_block(node, 0, true).unwrap();
    fs.truncate(node, 600).unwrap(); // two blocks

    fs.rename(ROOT_NODE, b"junk", RECYCLED_NODE, b"junk").unwrap();
    {
        let vol = fs.0.lock();
        let info = vol.root_info().unwrap();
        assert_eq!(info.deletedfiles.get(), 1);
        assert_eq!(info.deletedblocks.get(), 2);
    }

    assert_eq!(fs.lookup(RECYCLED_NODE, b"junk").unwrap(), node);
    fs.unlink(RECYCLED_NODE, b"junk").unwrap();

    {
        let vol = fs.0.lock();
        let info = vol.root_info().unwrap();
        assert_eq!(info.deletedfiles.get(), 0);
        assert_eq!(info.deletedblocks.get(), 0);
    }
    assert_free_matches_bitmap(&fs);
}

#[test]
fn creating_in_recycled_is_refused() {
    let (fs, _dev) = new_fs(1024);

    assert_eq!(
        fs.create(RECYCLED_NODE, b"f", ObjectType::File, 0o644, date(), None),
        Err(FsError::Invalid)
    );
}

#[test]
fn admin_space_grows_new_regions() {
    let (fs, _dev) = new_fs(4096);

    // each directory costs a hash table plus record space; enough of them
    // exhausts the initial 32-block admin region
    for i in 0..40u32 {
        mkdir(&fs, ROOT_NODE, format!("d{i:02}").as_bytes());
    }

    let free = fs.statfs().free_blocks;
    assert!(free < 4096 - 34 - 32, "no extra admin region was claimed");

    for i in 0..40u32 {
        assert!(fs.lookup(ROOT_NODE, format!("d{i:02}").as_bytes()).is_ok());
    }

    for i in 0..40u32 {
        fs.rmdir(ROOT_NODE, format!("d{i:02}").as_bytes()).unwrap();
    }
    assert_free_matches_bitmap(&fs);

    let vol = fs.0.lock();
    check_node_tree(&vol, vol.object_node_root);
}

#[test]
fn transaction_failure_block_forces_read_only() {
    let mut dev = MemDevice::new((1024 * BS) as usize);
    format(&mut dev, BS, DiskDate(0)).unwrap();

    // plant a TRFA marker two blocks past the root object container
    let mut marker = [0u8; 512];
    marker[..4].copy_from_slice(&BlockId::TRANSACTION_FAILURE.chars());
    marker[8..12].copy_from_slice(&3u32.to_be_bytes());
    let checksum = crate::fs::asfs::calc_checksum(&marker);
    marker[4..8].copy_from_slice(&checksum.to_be_bytes());
    dev.write_at(u64::from(3 * BS), &marker).unwrap();

    let fs = Asfs::mount(Box::new(dev.clone()), MountOptions::default()).unwrap();
    assert_eq!(
        fs.create(ROOT_NODE, b"f", ObjectType::File, 0o644, DiskDate(0), None),
        Err(FsError::ReadOnly)
    );
    assert_eq!(fs.truncate(ROOT_NODE, 0), Err(FsError::ReadOnly));
}

#[test]
fn broken_mirror_forces_read_only() {
    let mut dev = MemDevice::new((1024 * BS) as usize);
    format(&mut dev, BS, DiskDate(0)).unwrap();

    // flip a byte of the mirror root block
    dev.with_bytes_mut(|bytes| bytes[(1023 * BS) as usize + 100] ^= 0xff);

    let fs = Asfs::mount(Box::new(dev), MountOptions::default()).unwrap();
    assert_eq!(
        fs.create(ROOT_NODE, b"f", ObjectType::File, 0o644, DiskDate(0), None),
        Err(FsError::ReadOnly)
    );
}

#[test]
fn mount_rejects_garbage() {
    let dev = MemDevice::new((64 * BS) as usize);
    assert!(Asfs::mount(Box::new(dev), MountOptions::default()).is_err());
}

#[test]
fn readdir_cursor_survives_deletion() {
    let (fs, _dev) = new_fs(1024);

    for i in 0..20u32 {
        mkfile(&fs, ROOT_NODE, format!("f{i:02}").as_bytes());
    }

    // walk halfway, delete an already-emitted entry, keep walking
    let mut cursor = DirCursor::Start;
    let mut seen = Vec::new();

    for _ in 0..10 {
        let (entry, next) = fs.readdir(ROOT_NODE, cursor).unwrap().unwrap();
        seen.push(entry.name.clone());
        cursor = next;
    }

    let victim = seen.last().unwrap().clone();
    let before = seen[2].clone();
    if before != b".".to_vec() && before != b"..".to_vec() {
        fs.unlink(ROOT_NODE, &before).unwrap();
    }

    while let Some((entry, next)) = fs.readdir(ROOT_NODE, cursor).unwrap() {
        assert!(!seen.contains(&entry.name), "entry emitted twice");
        seen.push(entry.name.clone());
        cursor = next;
    }

    assert!(seen.contains(&victim));
}
