// SPDX-License-Identifier: MPL-2.0

use spin::Mutex;

use crate::{fs::FileSystem, inode::InodeType, prelude::*};

/// The origin of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(usize),
    End(isize),
    Current(isize),
}

/// An opened regular file with its own file offset.
#[derive(Debug)]
pub struct OpenFile {
    fs: Arc<dyn FileSystem>,
    ino: u64,
    offset: Mutex<usize>,
    append: bool,
}

impl OpenFile {
    /// Opens the inode `ino` of `fs`.
    ///
    /// When `append` is set, every write goes to the end of the file.
    pub fn open(fs: Arc<dyn FileSystem>, ino: u64, append: bool) -> Result<Self> {
        let metadata = fs.getattr(ino)?;
        if metadata.type_ == InodeType::Dir {
            return_errno_with_message!(Errno::EISDIR, "cannot open a directory as a file");
        }
        Ok(Self {
            fs,
            ino,
            offset: Mutex::new(0),
            append,
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn offset(&self) -> usize {
        *self.offset.lock()
    }

    /// Reads from the current offset and advances it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut offset = self.offset.lock();
        let len = self.fs.read_at(self.ino, *offset, buf)?;
        *offset += len;
        Ok(len)
    }

    /// Writes at the current offset (or at the end in append mode) and advances it.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut offset = self.offset.lock();
        if self.append {
            *offset = self.fs.getattr(self.ino)?.size;
        }
        let len = self.fs.write_at(self.ino, *offset, buf)?;
        *offset += len;
        Ok(len)
    }

    pub fn seek(&self, pos: SeekFrom) -> Result<usize> {
        let mut offset = self.offset.lock();
        let new_offset: isize = match pos {
            SeekFrom::Start(off /* as usize */) => {
                if off > isize::MAX as usize {
                    return_errno_with_message!(Errno::EINVAL, "file offset is too large");
                }
                off as isize
            }
            SeekFrom::End(off /* as isize */) => {
                let file_size = self.fs.getattr(self.ino)?.size as isize;
                file_size
                    .checked_add(off)
                    .ok_or_else(|| Error::with_message(Errno::EOVERFLOW, "file offset overflow"))?
            }
            SeekFrom::Current(off /* as isize */) => (*offset as isize)
                .checked_add(off)
                .ok_or_else(|| Error::with_message(Errno::EOVERFLOW, "file offset overflow"))?,
        };
        if new_offset < 0 {
            return_errno_with_message!(Errno::EINVAL, "file offset must not be negative");
        }
        // Invariant: 0 <= new_offset <= isize::MAX
        let new_offset = new_offset as usize;
        *offset = new_offset;
        Ok(new_offset)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        dirent_visitor::DirentVisitor,
        fs::FsStat,
        inode::{InodeMode, Metadata, NewInode, SetAttr},
    };

    /// A file system holding a single file (inode 2) in memory.
    #[derive(Debug, Default)]
    struct OneFileFs(Mutex<Vec<u8>>);

    impl FileSystem for OneFileFs {
        fn name(&self) -> &'static str {
            "onefile"
        }

        fn root_ino(&self) -> u64 {
            1
        }

        fn stat(&self) -> FsStat {
            FsStat {
                magic: 0,
                bsize: 512,
                blocks: 0,
                bfree: 0,
                bavail: 0,
                files: 1,
                ffree: 0,
                namelen: 255,
                read_only: false,
            }
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }

        fn unmount(&self) -> Result<()> {
            Ok(())
        }

        fn lookup(&self, _parent: u64, _name: &str) -> Result<Metadata> {
            return_errno!(Errno::ENOENT)
        }

        fn getattr(&self, ino: u64) -> Result<Metadata> {
            Ok(Metadata {
                ino,
                size: self.0.lock().len(),
                blk_size: 512,
                nr_sectors_allocated: 0,
                atime: Duration::ZERO,
                mtime: Duration::ZERO,
                ctime: Duration::ZERO,
                type_: if ino == 1 { InodeType::Dir } else { InodeType::File },
                mode: InodeMode::all(),
                nlinks: 1,
                uid: 0,
                gid: 0,
            })
        }

        fn setattr(&self, ino: u64, _attr: &SetAttr) -> Result<Metadata> {
            self.getattr(ino)
        }

        fn read_at(&self, _ino: u64, offset: usize, buf: &mut [u8]) -> Result<usize> {
            let data = self.0.lock();
            if offset >= data.len() {
                return Ok(0);
            }
            let len = buf.len().min(data.len() - offset);
            buf[..len].copy_from_slice(&data[offset..offset + len]);
            Ok(len)
        }

        fn write_at(&self, _ino: u64, offset: usize, buf: &[u8]) -> Result<usize> {
            let mut data = self.0.lock();
            if data.len() < offset + buf.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn readdir_at(
            &self,
            _ino: u64,
            _offset: usize,
            _visitor: &mut dyn DirentVisitor,
        ) -> Result<usize> {
            Ok(0)
        }

        fn create(&self, _parent: u64, _name: &str, _attr: NewInode) -> Result<Metadata> {
            return_errno!(Errno::ENOSYS)
        }

        fn link(&self, _parent: u64, _name: &str, _ino: u64) -> Result<Metadata> {
            return_errno!(Errno::ENOSYS)
        }

        fn unlink(&self, _parent: u64, _name: &str) -> Result<()> {
            return_errno!(Errno::ENOSYS)
        }

        fn rmdir(&self, _parent: u64, _name: &str) -> Result<()> {
            return_errno!(Errno::ENOSYS)
        }

        fn rename(&self, _: u64, _: &str, _: u64, _: &str) -> Result<()> {
            return_errno!(Errno::ENOSYS)
        }
    }

    #[test]
    fn seek_then_read() -> Result<()> {
        let fs = Arc::new(OneFileFs::default());
        let file = OpenFile::open(fs, 2, false)?;
        assert_eq!(file.write(b"hello world")?, 11);
        assert_eq!(file.seek(SeekFrom::Start(6))?, 6);

        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf)?, 5);
        assert_eq!(&buf, b"world");
        assert_eq!(file.seek(SeekFrom::End(-5))?, 6);
        assert_eq!(file.seek(SeekFrom::Current(-6))?, 0);
        assert_eq!(
            file.seek(SeekFrom::Current(-1)).unwrap_err().error(),
            Errno::EINVAL
        );
        Ok(())
    }

    #[test]
    fn append_mode_writes_at_end() -> Result<()> {
        let fs = Arc::new(OneFileFs::default());
        let file = OpenFile::open(fs.clone(), 2, true)?;
        file.write(b"abc")?;
        file.seek(SeekFrom::Start(0))?;
        file.write(b"def")?;
        assert_eq!(fs.0.lock().as_slice(), b"abcdef");
        Ok(())
    }

    #[test]
    fn directories_cannot_be_opened() {
        let fs = Arc::new(OneFileFs::default());
        let err = OpenFile::open(fs, 1, false).unwrap_err();
        assert_eq!(err.error(), Errno::EISDIR);
    }
}
