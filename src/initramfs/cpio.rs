//! newc cpio writer.
//!
//! The kernel unpacks initramfs images in the "new ASCII" cpio format
//! (`cpio -H newc`): a 110-byte header of hex fields per entry, the
//! NUL-terminated path, the file data, each padded to 4 bytes, and a final
//! `TRAILER!!!` entry.
//!
//! Ownership and timestamps are written as zero so the same tree always
//! produces the same bytes.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::Error;

pub const MAGIC: &[u8; 6] = b"070701";
pub const TRAILER: &str = "TRAILER!!!";
pub const HEADER_LEN: usize = 110;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Streams cpio entries into `W`.
pub struct CpioWriter<W: Write> {
    inner: W,
    offset: u64,
    next_ino: u32,
    entries: usize,
}

impl<W: Write> CpioWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            offset: 0,
            next_ino: 1,
            entries: 0,
        }
    }

    /// Number of entries written so far, trailer excluded.
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn append_dir(&mut self, name: &Path, perm: u32) -> io::Result<()> {
        self.header(name, S_IFDIR | (perm & !S_IFMT), 2, 0)?;
        self.entries += 1;
        Ok(())
    }

    pub fn append_file<R: Read>(&mut self, name: &Path, perm: u32, size: u64, data: R) -> io::Result<()> {
        let size32 = u32::try_from(size).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is too large for cpio ({} bytes)", name.display(), size),
            )
        })?;
        self.header(name, S_IFREG | (perm & !S_IFMT), 1, size32)?;

        let copied = io::copy(&mut data.take(size), &mut self.inner)?;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank while archiving", name.display()),
            ));
        }
        self.offset += copied;
        self.pad()?;
        self.entries += 1;
        Ok(())
    }

    pub fn append_symlink(&mut self, name: &Path, target: &Path) -> io::Result<()> {
        let target = target.as_os_str().as_bytes();
        self.header(name, S_IFLNK | 0o777, 1, target.len() as u32)?;
        self.write_raw(target)?;
        self.pad()?;
        self.entries += 1;
        Ok(())
    }

    /// Write the trailer and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.next_ino = 0;
        self.header(Path::new(TRAILER), 0, 1, 0)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn header(&mut self, name: &Path, mode: u32, nlink: u32, filesize: u32) -> io::Result<()> {
        let name = name.as_os_str().as_bytes();
        let ino = self.next_ino;
        if ino != 0 {
            self.next_ino += 1;
        }

        let fields = [
            ino,
            mode,
            0, // uid
            0, // gid
            nlink,
            0, // mtime
            filesize,
            0, // devmajor
            0, // devminor
            0, // rdevmajor
            0, // rdevminor
            name.len() as u32 + 1,
            0, // check
        ];

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        for field in fields {
            write!(header, "{:08X}", field)?;
        }
        self.write_raw(&header)?;
        self.write_raw(name)?;
        self.write_raw(&[0])?;
        self.pad()
    }

    fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn pad(&mut self) -> io::Result<()> {
        let rem = (self.offset % 4) as usize;
        if rem != 0 {
            self.write_raw(&[0u8; 3][..4 - rem])?;
        }
        Ok(())
    }
}

/// Serialize everything under `root` (not `root` itself) into `out`.
///
/// Entries are visited in file-name order, parents before children, with
/// paths relative to `root`. Returns the number of entries written.
pub fn write_tree<W: Write>(root: &Path, out: W) -> Result<usize> {
    let mut writer = CpioWriter::new(out);

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let path = entry.path();
        let name = path
            .strip_prefix(root)
            .with_context(|| format!("{} escaped {}", path.display(), root.display()))?;
        let md = fs::symlink_metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;

        match md.mode() & S_IFMT {
            S_IFDIR => writer.append_dir(name, md.mode())?,
            S_IFREG => {
                let file = File::open(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                writer
                    .append_file(name, md.mode(), md.len(), file)
                    .with_context(|| format!("Failed to archive {}", path.display()))?;
            }
            S_IFLNK => {
                let target = fs::read_link(path)?;
                writer.append_symlink(name, &target)?;
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "unsupported file type {:o} at {}",
                    other,
                    path.display()
                ))
                .into())
            }
        }
    }

    let entries = writer.entries();
    writer.finish()?;
    Ok(entries)
}
