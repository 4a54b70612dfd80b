//! Errno mapping for engine errors.
//!
//! Locally recoverable conditions never reach this point (they become
//! suspensions inside the engine); what remains translates to
//! conservative POSIX errno values.

use std::ffi::c_int;

use nimbus_core::domain::DomainError;
use nimbus_core::ports::remote::RemoteErrorKind;
use nimbus_vfs::VfsError;

/// Maps an engine error to the errno handed to the kernel.
pub fn errno_for(error: &VfsError) -> c_int {
    match error {
        VfsError::Domain(domain) => match domain {
            DomainError::SiblingCollision(_) => libc::EEXIST,
            DomainError::InvalidName(_) => libc::EINVAL,
            DomainError::InvalidState { .. } => libc::EIO,
            _ => libc::EINVAL,
        },
        VfsError::NotFound(_) => libc::ENOENT,
        VfsError::NotEmpty(_) => libc::ENOTEMPTY,
        VfsError::Interrupted => libc::EINTR,
        VfsError::Offline(_) => libc::EIO,
        VfsError::Remote(remote) => match remote.kind() {
            RemoteErrorKind::NotFound => libc::ENOENT,
            RemoteErrorKind::Conflict => libc::EEXIST,
            RemoteErrorKind::Auth => libc::EACCES,
            RemoteErrorKind::Validation => {
                if remote.message().contains("quota") {
                    libc::ENOSPC
                } else {
                    libc::EINVAL
                }
            }
            _ => libc::EIO,
        },
        VfsError::Store(_) | VfsError::Corrupt(_) => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::ports::remote::RemoteError;

    #[test]
    fn test_domain_mappings() {
        assert_eq!(
            errno_for(&VfsError::Domain(DomainError::SiblingCollision("A".into()))),
            libc::EEXIST
        );
        assert_eq!(
            errno_for(&VfsError::Domain(DomainError::InvalidName("a/b".into()))),
            libc::EINVAL
        );
    }

    #[test]
    fn test_structural_mappings() {
        assert_eq!(errno_for(&VfsError::NotFound("x".into())), libc::ENOENT);
        assert_eq!(errno_for(&VfsError::NotEmpty("d".into())), libc::ENOTEMPTY);
        assert_eq!(errno_for(&VfsError::Interrupted), libc::EINTR);
        assert_eq!(errno_for(&VfsError::Offline("o".into())), libc::EIO);
    }

    #[test]
    fn test_remote_mappings() {
        assert_eq!(
            errno_for(&VfsError::Remote(RemoteError::validation("bad name"))),
            libc::EINVAL
        );
        assert_eq!(
            errno_for(&VfsError::Remote(RemoteError::validation("quota exceeded"))),
            libc::ENOSPC
        );
        assert_eq!(
            errno_for(&VfsError::Remote(RemoteError::not_found("gone"))),
            libc::ENOENT
        );
        assert_eq!(
            errno_for(&VfsError::Remote(RemoteError::network("down"))),
            libc::EIO
        );
    }
}
