use core::fmt::Debug;

use alloc::boxed::Box;

/// `BaseError` is a common trait implemented by every error type defined in
/// this crate.
///
/// It is dependent on the [`Debug`] trait, which makes sense as we are dealing
/// with errors.
pub trait BaseError: Debug {}

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
///
/// For instance, it could be used when initializing a component, or for
/// operations that only mutate on-disk state.
pub type CanFail<T> = Result<(), T>;

/// `IOError` defines several error types useful when communicating with the
/// backing block device.
#[derive(Debug)]
pub enum IOError {
    /// Access past the end of the backing device.
    OutOfBounds,

    /// The backing device reported a failure.
    DeviceError,

    /// Generic error.
    Exception(Box<dyn BaseError>),
}

impl BaseError for IOError {}

/// `MountError` defines the ways a mount attempt can be rejected.
#[derive(Debug)]
pub enum MountError {
    /// Failure while reading from the backing device.
    IOError,

    /// The root block is absent, carries the wrong id, or fails its checksum.
    BadRootBlock,

    /// The root block declares a structure version this engine does not
    /// implement.
    UnsupportedVersion,

    /// The root block declares a block size that is not a power of two of at
    /// least 512 bytes, or one the backing device cannot hold.
    BadBlockSize,
}

impl BaseError for MountError {}

/// `FsError` is the error surface of the filesystem engine itself.
///
/// Every operation on a mounted volume reports failures through one of these
/// kinds; the engine does not retry and does not attempt in-place repair.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsError {
    /// The free-block reserve would be violated, or the bitmap is exhausted.
    NoSpace,

    /// Object, node, or extent key absent.
    NotFound,

    /// A block read failed, or a checksum, id or own-block field did not match
    /// expectation.
    Io,

    /// Invalid name, invalid object kind for the operation, or an attempt to
    /// create inside the recycled directory.
    Invalid,

    /// Attempt to remove a directory that still has entries.
    NotEmpty,

    /// Write attempted on a volume that was mounted (or forced) read-only.
    ReadOnly,
}

impl BaseError for FsError {}

impl From<IOError> for FsError {
    fn from(_: IOError) -> Self {
        FsError::Io
    }
}
