//! Amiga Smart File System engine.
//!
//! The engine mutates a fixed-block-size backing device while preserving the
//! exact on-disk format of the original Amiga SFS, so volumes remain
//! interchangeable. Four interlocked managers hold the invariants: the space
//! allocator ([`bitmap`], [`adminspace`]), the extent B-tree ([`extent`]),
//! the object-node tree ([`node`]) and the object containers with their hash
//! chains ([`object`]).
//!
//! [`Asfs`] is the handle exposed to the VFS binding layer. It is a clone of
//! an `Arc` around the volume state guarded by one coarse lock; every entry
//! point, including the read-only ones, takes that lock for its whole
//! duration. All structures on disk are big-endian.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bytemuck::Pod;
use hashbrown::HashMap;
use spin::Mutex;

use crate::errors::{CanFail, FsError, MountError};
use crate::fs::{DirCursor, DirEntry, IOResult, ObjectInfo, ObjectType, StatFs};
use crate::io::BlockDevice;

mod adminspace;
mod bitfuncs;
mod bitmap;
mod dir;
mod extent;
mod file;
mod format;
mod link;
mod name;
mod node;
mod object;
mod structs;

#[cfg(test)]
mod tests;

pub use format::format;
pub use structs::DiskDate;

use file::CachedExtent;
use structs::{
    BlockHeader, BlockId, ObjectBits, ObjectDesc, Protection, RootBits, RootBlock, RootInfo,
    BITMAP_HEADER_SIZE, MAX_NAME_LEN, ROOT_BLOCK_SIZE, ROOT_INFO_SIZE, STRUCTURE_VERSION,
};

/// Mount-time options.
///
/// `mode`, `uid` and `gid` are the ownership triple presented for every
/// object; `prefix`, `root_volume` and `lowercase_vol` parameterize the
/// symlink rewriting done by the layer above; `iocharset` and `codepage` name
/// the translation tables of that same layer. The core stores these but only
/// interprets the ownership triple.
#[derive(Clone, Debug)]
pub struct MountOptions {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub prefix: Option<Vec<u8>>,
    pub root_volume: Option<Vec<u8>>,
    pub lowercase_vol: bool,
    pub iocharset: Option<Vec<u8>>,
    pub codepage: Option<Vec<u8>>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            mode: 0o644,
            uid: 0,
            gid: 0,
            prefix: None,
            root_volume: None,
            lowercase_vol: false,
            iocharset: None,
            codepage: None,
        }
    }
}

/// A pinned block buffer.
///
/// Owning a `Block` pins it; dropping it releases it. Modifications reach the
/// device only through [`AsfsVolume::store`], which recomputes the checksum,
/// so a dropped buffer discards its edits.
pub(crate) struct Block {
    pub(crate) number: u32,
    pub(crate) data: Vec<u8>,
}

impl Block {
    /// Copies a typed record out of the buffer.
    pub(crate) fn get<T: Pod>(&self, offset: usize) -> T {
        bytemuck::pod_read_unaligned(&self.data[offset..offset + core::mem::size_of::<T>()])
    }

    /// Copies a typed record into the buffer.
    pub(crate) fn put<T: Pod>(&mut self, offset: usize, value: &T) {
        self.data[offset..offset + core::mem::size_of::<T>()]
            .copy_from_slice(bytemuck::bytes_of(value));
    }

    pub(crate) fn header(&self) -> BlockHeader {
        self.get(0)
    }
}

/// In-core state of a mounted volume.
pub(crate) struct AsfsVolume {
    device: Box<dyn BlockDevice>,

    pub(crate) block_size: u32,
    pub(crate) block_size_bits: u32,
    pub(crate) total_blocks: u32,

    pub(crate) root_object_container: u32,
    pub(crate) extent_b_root: u32,
    pub(crate) object_node_root: u32,
    pub(crate) admin_space_container: u32,
    pub(crate) bitmap_base: u32,

    /// Blocks covered by one bitmap block; always a multiple of 32.
    pub(crate) blocks_in_bitmap: u32,
    pub(crate) bitmap_blocks: u32,

    /// Cached copy of the free-block count in the root info trailer.
    pub(crate) free_blocks: u32,
    pub(crate) roving_block_ptr: u32,

    pub(crate) case_sensitive: bool,
    pub(crate) read_only: bool,

    pub(crate) options: MountOptions,

    /// Last extent consulted per file, keyed by object node.
    pub(crate) extent_cache: HashMap<u32, CachedExtent>,
}

/// Amiga-style sum-to-zero checksum: all big-endian words of the block plus
/// the checksum field itself sum to 0 modulo 2^32.
pub(crate) fn calc_checksum(data: &[u8]) -> u32 {
    let mut checksum: u32 = 1;

    for w in data.chunks_exact(4) {
        checksum = checksum.wrapping_add(u32::from_be_bytes([w[0], w[1], w[2], w[3]]));
    }

    let stored = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    checksum.wrapping_sub(stored).wrapping_neg()
}

/// Validates checksum, own-block number and id of a typed block.
pub(crate) fn check_block(data: &[u8], number: u32, id: BlockId) -> bool {
    let header: BlockHeader = bytemuck::pod_read_unaligned(&data[..12]);

    calc_checksum(data) == header.checksum.get()
        && header.ownblock.get() == number
        && header.id == id
}

impl AsfsVolume {
    fn block_offset(&self, n: u32) -> u64 {
        u64::from(n) * u64::from(self.block_size)
    }

    /// Reads block `n` and validates it as a typed block with id `id`.
    ///
    /// # Errors
    ///
    /// [`FsError::Io`] when the read fails or the block does not validate;
    /// validation failures are logged as corruption.
    pub(crate) fn read_checked(&self, n: u32, id: BlockId) -> IOResult<Block> {
        if n >= self.total_blocks {
            log::error!(target: "asfs", "block {n} requested past the end of the volume");
            return Err(FsError::Io);
        }

        let mut data = vec![0u8; self.block_size as usize];
        self.device.read_at(self.block_offset(n), &mut data)?;

        if !check_block(&data, n, id) {
            log::error!(
                target: "asfs",
                "block {n} failed validation, expected id {id:?}, found {:?}",
                bytemuck::pod_read_unaligned::<BlockHeader>(&data[..12]).id
            );
            return Err(FsError::Io);
        }

        Ok(Block { number: n, data })
    }

    /// Quietly checks whether block `n` validates as a typed block with id
    /// `id`. Used for mount-time probes where a mismatch is the normal case.
    pub(crate) fn probe_block(&self, n: u32, id: BlockId) -> bool {
        if n >= self.total_blocks {
            return false;
        }

        let mut data = vec![0u8; self.block_size as usize];
        if self.device.read_at(self.block_offset(n), &mut data).is_err() {
            return false;
        }

        check_block(&data, n, id)
    }

    /// Returns a zero-filled buffer for block `n` with its header
    /// initialised. The block reaches the device on [`AsfsVolume::store`].
    pub(crate) fn zeroed_block(&self, n: u32, id: BlockId) -> Block {
        let mut block = Block {
            number: n,
            data: vec![0u8; self.block_size as usize],
        };

        block.put(
            0,
            &BlockHeader {
                id,
                checksum: structs::Be32::ZERO,
                ownblock: structs::Be32::new(n),
            },
        );
        block
    }

    /// Recomputes the checksum and writes the buffer through to the device.
    pub(crate) fn store(&mut self, block: &mut Block) -> CanFail<FsError> {
        let checksum = calc_checksum(&block.data);
        block.data[4..8].copy_from_slice(&checksum.to_be_bytes());

        let offset = self.block_offset(block.number);
        self.device.write_at(offset, &block.data)?;
        Ok(())
    }

    /// Number of whole blocks needed for `bytes` bytes.
    pub(crate) fn size_to_blocks(&self, bytes: u32) -> u32 {
        (bytes.wrapping_add(self.block_size - 1)) >> self.block_size_bits
    }

    pub(crate) fn root_info(&self) -> IOResult<RootInfo> {
        let bh = self.read_checked(self.root_object_container, BlockId::OBJECT_CONTAINER)?;
        Ok(bh.get(self.block_size as usize - ROOT_INFO_SIZE))
    }

    pub(crate) fn update_root_info(
        &mut self,
        f: impl FnOnce(&mut RootInfo),
    ) -> CanFail<FsError> {
        let mut bh = self.read_checked(self.root_object_container, BlockId::OBJECT_CONTAINER)?;
        let off = self.block_size as usize - ROOT_INFO_SIZE;

        let mut info: RootInfo = bh.get(off);
        f(&mut info);
        bh.put(off, &info);

        self.store(&mut bh)
    }
}

/// A mounted volume.
///
/// Cloning the handle is cheap; all clones share the same volume lock.
#[derive(Clone)]
pub struct Asfs(Arc<Mutex<AsfsVolume>>);

impl Asfs {
    /// Mounts a volume.
    ///
    /// The root block is probed with a 512-byte read, then re-read at the
    /// block size it declares and fully validated. A `TRFA` marker block or a
    /// missing mirror root block forces the volume read-only.
    ///
    /// # Errors
    ///
    /// Any [`MountError`] variant; the device is returned to the caller only
    /// by dropping the handle.
    pub fn mount(device: Box<dyn BlockDevice>, options: MountOptions) -> Result<Self, MountError> {
        let mut probe = [0u8; 512];
        device
            .read_at(0, &mut probe)
            .map_err(|_| MountError::IOError)?;

        let root: RootBlock = bytemuck::pod_read_unaligned(&probe[..ROOT_BLOCK_SIZE]);

        if root.header.id != BlockId::ROOT {
            return Err(MountError::BadRootBlock);
        }
        if root.version.get() != STRUCTURE_VERSION {
            return Err(MountError::UnsupportedVersion);
        }

        let block_size = root.blocksize.get();
        if !block_size.is_power_of_two() || block_size < 512 {
            return Err(MountError::BadBlockSize);
        }

        let total_blocks = root.totalblocks.get();
        if total_blocks < 2
            || u64::from(total_blocks) * u64::from(block_size) > device.size()
        {
            return Err(MountError::BadBlockSize);
        }

        // Reopen at the declared block size and validate the full root block.
        let mut data = vec![0u8; block_size as usize];
        device.read_at(0, &mut data).map_err(|_| MountError::IOError)?;
        if !check_block(&data, 0, BlockId::ROOT) {
            log::error!(target: "asfs", "root block checksum error");
            return Err(MountError::BadRootBlock);
        }

        let blocks_in_bitmap = (block_size - BITMAP_HEADER_SIZE as u32) * 8;

        let mut vol = AsfsVolume {
            device,
            block_size,
            block_size_bits: block_size.trailing_zeros(),
            total_blocks,
            root_object_container: root.rootobjectcontainer.get(),
            extent_b_root: root.extentbnoderoot.get(),
            object_node_root: root.objectnoderoot.get(),
            admin_space_container: root.adminspacecontainer.get(),
            bitmap_base: root.bitmapbase.get(),
            blocks_in_bitmap,
            bitmap_blocks: (total_blocks + blocks_in_bitmap - 1) / blocks_in_bitmap,
            free_blocks: 0,
            roving_block_ptr: 0,
            case_sensitive: RootBits(root.bits).contains(RootBits::CASE_SENSITIVE),
            read_only: false,
            options,
            extent_cache: HashMap::new(),
        };

        match vol.root_info() {
            Ok(info) => {
                vol.free_blocks = info.freeblocks.get();
                let roving = info.rovingpointer.get();
                vol.roving_block_ptr = if roving < total_blocks { roving } else { 0 };
            }
            Err(_) => vol.free_blocks = 0,
        }

        if vol.probe_block(
            vol.root_object_container + 2,
            BlockId::TRANSACTION_FAILURE,
        ) {
            log::warn!(target: "asfs", "volume has an unfinished transaction, mounting read-only");
            vol.read_only = true;
        }

        if !vol.probe_block(total_blocks - 1, BlockId::ROOT) {
            log::warn!(target: "asfs", "no second root block, mounting read-only");
            vol.read_only = true;
        }

        log::info!(
            target: "asfs",
            "mounted volume: {total_blocks} blocks of {block_size} bytes, {} free, case {}",
            vol.free_blocks,
            if vol.case_sensitive { "sensitive" } else { "insensitive" }
        );

        Ok(Self(Arc::new(Mutex::new(vol))))
    }

    pub fn statfs(&self) -> StatFs {
        let vol = self.0.lock();

        StatFs {
            total_blocks: vol.total_blocks,
            free_blocks: vol.free_blocks,
            block_size: vol.block_size,
            max_name_len: MAX_NAME_LEN as u32,
        }
    }

    /// Resolves `name` inside the directory `dir`.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] when no entry matches.
    pub fn lookup(&self, dir: u32, name: &[u8]) -> IOResult<u32> {
        self.0.lock().lookup(dir, name)
    }

    /// Produces the next directory entry after `cursor`, or `None` at the end
    /// of the directory.
    pub fn readdir(
        &self,
        dir: u32,
        cursor: DirCursor,
    ) -> IOResult<Option<(DirEntry, DirCursor)>> {
        self.0.lock().readdir_step(dir, cursor)
    }

    /// Reads the object record behind a node number.
    pub fn read_object(&self, node: u32) -> IOResult<ObjectInfo> {
        let vol = self.0.lock();
        let (bh, off) = vol.read_object_record(node)?;
        Ok(vol.object_info(&bh, off))
    }

    /// Creates a file, directory or soft link named `name` inside `dir`.
    ///
    /// New objects carry the fixed AmigaDOS protection set
    /// (READ|WRITE|EXECUTE|DELETE); `mode` exists for interface parity with
    /// the binding layer, whose permission presentation comes from the
    /// mount-time triple (see [`ObjectInfo::mode`]). Soft links store
    /// `target` verbatim.
    ///
    /// # Errors
    ///
    /// [`FsError::Invalid`] for bad names, an already existing entry, or a
    /// missing soft-link target; [`FsError::NoSpace`] when the free reserve
    /// would be violated.
    pub fn create(
        &self,
        dir: u32,
        name: &[u8],
        kind: ObjectType,
        mode: u16,
        date: DiskDate,
        target: Option<&[u8]>,
    ) -> IOResult<u32> {
        let _ = mode;
        let mut vol = self.0.lock();

        if vol.read_only {
            return Err(FsError::ReadOnly);
        }
        name::check_name(name)?;
        if kind == ObjectType::SoftLink && target.is_none() {
            return Err(FsError::Invalid);
        }

        match vol.lookup(dir, name) {
            Ok(_) => return Err(FsError::Invalid),
            Err(FsError::NotFound) => (),
            Err(e) => return Err(e),
        }

        let protection = Protection::DELETE
            | Protection::EXECUTE
            | Protection::WRITE
            | Protection::READ;

        let mut desc = ObjectDesc::default();
        desc.protection = structs::Be32::new(protection.0);
        desc.datemodified = structs::Be32::new(date.0);
        desc.bits = match kind {
            ObjectType::File => ObjectBits(0),
            ObjectType::Directory => ObjectBits::DIR,
            ObjectType::SoftLink => ObjectBits::LINK,
        };

        let (mut bh, off) = vol.create_object(dir, &desc, name, false)?;
        let new_node = bh.get::<ObjectDesc>(off).objectnode.get();
        vol.store(&mut bh)?;
        drop(bh);

        if kind == ObjectType::SoftLink {
            if let Some(target) = target {
                vol.write_link(new_node, target)?;
            }
        }

        Ok(new_node)
    }

    /// Removes the non-directory entry `name` from `dir`.
    ///
    /// # Errors
    ///
    /// [`FsError::Invalid`] when the entry is a directory; use
    /// [`Asfs::rmdir`] for those.
    pub fn unlink(&self, dir: u32, name: &[u8]) -> CanFail<FsError> {
        let mut vol = self.0.lock();

        if vol.read_only {
            return Err(FsError::ReadOnly);
        }

        let node = vol.lookup(dir, name)?;
        let (bh, off) = vol.read_object_record(node)?;

        if bh.get::<ObjectDesc>(off).bits.contains(ObjectBits::DIR) {
            return Err(FsError::Invalid);
        }

        vol.delete_object(bh, off)
    }

    /// Removes the directory entry `name` from `dir`.
    ///
    /// # Errors
    ///
    /// [`FsError::NotEmpty`] when the directory still has entries,
    /// [`FsError::Invalid`] when the entry is not a directory.
    pub fn rmdir(&self, dir: u32, name: &[u8]) -> CanFail<FsError> {
        let mut vol = self.0.lock();

        if vol.read_only {
            return Err(FsError::ReadOnly);
        }

        let node = vol.lookup(dir, name)?;
        let (bh, off) = vol.read_object_record(node)?;

        if !bh.get::<ObjectDesc>(off).bits.contains(ObjectBits::DIR) {
            return Err(FsError::Invalid);
        }

        vol.delete_object(bh, off)
    }

    /// Moves `old_dir/old_name` to `new_dir/new_name`, overwriting an
    /// existing destination. The object keeps its node number.
    pub fn rename(
        &self,
        old_dir: u32,
        old_name: &[u8],
        new_dir: u32,
        new_name: &[u8],
    ) -> CanFail<FsError> {
        let mut vol = self.0.lock();

        if vol.read_only {
            return Err(FsError::ReadOnly);
        }
        name::check_name(new_name)?;

        let src = vol.lookup(old_dir, old_name)?;

        match vol.lookup(new_dir, new_name) {
            Ok(dest) if dest != src => {
                let (bh, off) = vol.read_object_record(dest)?;
                vol.delete_object(bh, off)?;
            }
            // Renaming an entry onto itself (case changes on an insensitive
            // volume land here as well): no destination to unlink.
            Ok(_) => (),
            Err(FsError::NotFound) => (),
            Err(e) => return Err(e),
        }

        vol.rename_object(src, new_dir, new_name)
    }

    /// Maps a file-logical block to its physical block, allocating space when
    /// `create` is set.
    ///
    /// This is the page-cache block-mapping hook: writes grow files through
    /// `get_block(create = true)`, then [`Asfs::truncate`] settles the byte
    /// size.
    pub fn get_block(&self, node: u32, logical: u32, create: bool) -> IOResult<u32> {
        let mut vol = self.0.lock();

        if create && vol.read_only {
            return Err(FsError::ReadOnly);
        }

        vol.get_block(node, logical, create)
    }

    /// Shrinks the file behind `node` to `new_size` bytes, releasing any
    /// blocks past the end. Growing is a no-op.
    pub fn truncate(&self, node: u32, new_size: u32) -> CanFail<FsError> {
        let mut vol = self.0.lock();

        if vol.read_only {
            return Err(FsError::ReadOnly);
        }

        vol.truncate(node, new_size)
    }

    /// Reads a soft link's target bytes, exactly as stored.
    pub fn read_link(&self, node: u32) -> IOResult<Vec<u8>> {
        self.0.lock().read_link(node)
    }

    /// Replaces a soft link's target bytes.
    pub fn write_link(&self, node: u32, target: &[u8]) -> CanFail<FsError> {
        let mut vol = self.0.lock();

        if vol.read_only {
            return Err(FsError::ReadOnly);
        }

        vol.write_link(node, target)
    }
}
