//! Small libc helpers shared by the default implementations.

use launcher_core::status::Status;

#[inline]
pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Map a POSIX errno onto the protocol's status space.
pub fn status_from_errno(errno: i32) -> Status {
    match errno {
        0 => Status::OK,
        libc::ENOMEM => Status::NO_MEMORY,
        libc::EINVAL | libc::E2BIG | libc::ENAMETOOLONG => Status::INVALID_ARGS,
        libc::EBADF => Status::BAD_HANDLE,
        libc::ENOTDIR | libc::EISDIR | libc::ENOTSOCK => Status::WRONG_TYPE,
        libc::ENOENT => Status::NOT_FOUND,
        libc::EACCES | libc::EPERM => Status::ACCESS_DENIED,
        libc::EAGAIN => Status::SHOULD_WAIT,
        libc::EPIPE | libc::ECONNRESET => Status::PEER_CLOSED,
        libc::ENOEXEC | libc::ENOSYS | libc::EOPNOTSUPP => Status::NOT_SUPPORTED,
        libc::EMFILE | libc::ENFILE | libc::ENOSPC => Status::NO_RESOURCES,
        libc::EIO => Status::IO,
        _ => Status::INTERNAL,
    }
}

/// `-1` → `Err(errno)`, anything else passes through.
#[inline]
pub fn cvt(ret: libc::c_int) -> Result<libc::c_int, i32> {
    if ret < 0 {
        Err(errno())
    } else {
        Ok(ret)
    }
}

/// Retry `f` while it fails with `EINTR`.
pub fn retry_eintr<F>(mut f: F) -> Result<isize, i32>
where
    F: FnMut() -> isize,
{
    loop {
        let ret = f();
        if ret >= 0 {
            return Ok(ret);
        }
        let e = errno();
        if e != libc::EINTR {
            return Err(e);
        }
    }
}
