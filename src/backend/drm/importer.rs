//! Importing producer buffers into a display device
//!
//! An [`Importer`] turns a [`Dmabuf`] handed over by a producer into kernel buffer
//! handles of one device, so the buffer can be attached to a plane. Every device gets
//! its own importer, handles are not shared across devices.

use std::fmt;

use smallvec::SmallVec;

use crate::backend::allocator::{dmabuf::Dmabuf, Buffer, Fourcc};
use crate::utils::{Buffer as BufferCoords, Size};

/// Errors thrown while importing a buffer
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The buffer has more planes than the device supports
    #[error("Buffer has {0} planes, more than supported")]
    TooManyPlanes(usize),
    /// The buffer has an empty size
    #[error("Buffer has an invalid size {0:?}")]
    InvalidSize(Size<i32, BufferCoords>),
    /// The kernel rejected the import
    #[error("Failed to import buffer")]
    Import(#[source] std::io::Error),
}

/// Device-side handles of an imported buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedBuffer {
    /// One kernel buffer handle per plane
    pub handles: SmallVec<[u32; 4]>,
    /// Size of the buffer
    pub size: Size<i32, BufferCoords>,
    /// Format of the buffer
    pub format: Fourcc,
}

/// Converts producer buffers into device handles
pub trait Importer: fmt::Debug + Send + Sync {
    /// Import the given buffer
    fn import(&self, buffer: &Dmabuf) -> Result<ImportedBuffer, ImportError>;

    /// Release the device handles of a buffer previously returned by [`Importer::import`]
    fn release(&self, buffer: &ImportedBuffer);
}

pub(crate) fn check_buffer(buffer: &Dmabuf) -> Result<(), ImportError> {
    if buffer.num_planes() > 4 {
        return Err(ImportError::TooManyPlanes(buffer.num_planes()));
    }
    let size = buffer.size();
    if size.w <= 0 || size.h <= 0 {
        return Err(ImportError::InvalidSize(size));
    }
    Ok(())
}

#[cfg(feature = "backend_drm")]
pub use self::kms::DrmImporter;

#[cfg(feature = "backend_drm")]
mod kms {
    use std::os::unix::io::AsFd;

    use drm::control::Device as ControlDevice;
    use smallvec::SmallVec;
    use tracing::{trace, warn};

    use super::{check_buffer, ImportError, ImportedBuffer, Importer};
    use crate::backend::allocator::{dmabuf::Dmabuf, Buffer};
    use crate::backend::drm::DrmDeviceFd;

    /// [`Importer`] using PRIME to import buffers into a drm device
    #[derive(Debug, Clone)]
    pub struct DrmImporter {
        fd: DrmDeviceFd,
    }

    impl DrmImporter {
        /// Create a new importer for the given device
        pub fn new(fd: DrmDeviceFd) -> DrmImporter {
            DrmImporter { fd }
        }
    }

    impl Importer for DrmImporter {
        fn import(&self, buffer: &Dmabuf) -> Result<ImportedBuffer, ImportError> {
            check_buffer(buffer)?;

            let mut handles = SmallVec::new();
            for fd in buffer.handles() {
                match self.fd.prime_fd_to_buffer(fd.as_fd()) {
                    Ok(handle) => handles.push(u32::from(handle)),
                    Err(err) => {
                        let imported = ImportedBuffer {
                            handles,
                            size: buffer.size(),
                            format: buffer.format().code,
                        };
                        self.release(&imported);
                        return Err(ImportError::Import(err));
                    }
                }
            }

            trace!(?handles, "Imported buffer");
            Ok(ImportedBuffer {
                handles,
                size: buffer.size(),
                format: buffer.format().code,
            })
        }

        fn release(&self, buffer: &ImportedBuffer) {
            let mut released = SmallVec::<[u32; 4]>::new();
            for &handle in &buffer.handles {
                // planes of one buffer may share a handle
                if released.contains(&handle) {
                    continue;
                }
                released.push(handle);
                let Some(raw) = std::num::NonZeroU32::new(handle) else {
                    continue;
                };
                if let Err(err) = self.fd.close_buffer(drm::buffer::Handle::from(raw)) {
                    warn!(handle, "Failed to release imported buffer: {}", err);
                }
            }
        }
    }
}
