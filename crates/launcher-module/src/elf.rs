//! ELF interpreter probe.
//!
//! Reads just enough of an executable image to decide how to start it: a
//! static image is executed directly, a dynamic one names its interpreter
//! in a `PT_INTERP` program header and needs the loader service to supply
//! that interpreter.
//!
//! Only ELF64 little-endian images are accepted. Anything else, scripts
//! included, is `NOT_SUPPORTED`.

use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd};

use launcher_core::error::BuildError;
use launcher_core::status::Status;

use crate::sys::{retry_eintr, status_from_errno};

const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const PT_INTERP: u32 = 3;

/// Program header tables longer than this are rejected as malformed.
const MAX_PHNUM: usize = 256;
const MAX_INTERP: usize = 4096;

/// ELF64 file header. 64 bytes at offset 0.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct Elf64Header {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// ELF64 program header. 56 bytes per entry.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageKind {
    Static,
    Dynamic { interp: CString },
}

fn not_supported(msg: &str) -> BuildError {
    BuildError::new(Status::NOT_SUPPORTED, msg)
}

fn pread_exact(fd: BorrowedFd<'_>, buf: &mut [u8], offset: u64) -> Result<(), BuildError> {
    let mut done = 0;
    while done < buf.len() {
        let n = retry_eintr(|| unsafe {
            libc::pread(
                fd.as_raw_fd(),
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
                (offset + done as u64) as libc::off_t,
            )
        })
        .map_err(|e| BuildError::new(status_from_errno(e), "read image"))?;
        if n == 0 {
            return Err(not_supported("image truncated"));
        }
        done += n as usize;
    }
    Ok(())
}

/// Read a `T` from the front of `bytes`. `T` must be plain data.
fn read_struct<T: Copy>(bytes: &[u8]) -> T {
    assert!(bytes.len() >= std::mem::size_of::<T>());
    unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) }
}

pub fn probe(image: BorrowedFd<'_>) -> Result<ImageKind, BuildError> {
    let mut raw = [0u8; std::mem::size_of::<Elf64Header>()];
    pread_exact(image, &mut raw, 0).map_err(|e| match e.status {
        Status::NOT_SUPPORTED => not_supported("not an ELF image"),
        _ => e,
    })?;
    let ehdr: Elf64Header = read_struct(&raw);

    if ehdr.e_ident[..4] != ELFMAG {
        return Err(not_supported("not an ELF image"));
    }
    if ehdr.e_ident[4] != ELFCLASS64 || ehdr.e_ident[5] != ELFDATA2LSB {
        return Err(not_supported("only ELF64 little-endian images are supported"));
    }

    let phentsize = ehdr.e_phentsize as usize;
    let phnum = ehdr.e_phnum as usize;
    if phnum == 0 {
        return Ok(ImageKind::Static);
    }
    if phentsize < std::mem::size_of::<Elf64Phdr>() || phnum > MAX_PHNUM {
        return Err(not_supported("malformed program header table"));
    }

    let mut table = vec![0u8; phentsize * phnum];
    pread_exact(image, &mut table, ehdr.e_phoff)?;

    for entry in table.chunks_exact(phentsize) {
        let phdr: Elf64Phdr = read_struct(entry);
        if phdr.p_type != PT_INTERP {
            continue;
        }
        let len = phdr.p_filesz as usize;
        if len == 0 || len > MAX_INTERP {
            return Err(not_supported("malformed PT_INTERP"));
        }
        let mut path = vec![0u8; len];
        pread_exact(image, &mut path, phdr.p_offset)?;
        // The segment holds a NUL-terminated path.
        if let Some(end) = path.iter().position(|&b| b == 0) {
            path.truncate(end);
        }
        let interp = CString::new(path).map_err(|_| not_supported("malformed PT_INTERP"))?;
        return Ok(ImageKind::Dynamic { interp });
    }
    Ok(ImageKind::Static)
}
