//! Read-only archive filesystem on the cartridge.
//!
//! An archive starts with a header (`b"QFS1"` and the entry count) followed by the entry table.
//! Each entry holds a NUL padded name, the offset of the file from the start of the archive and
//! its size. All fields are big-endian. Directories are implied by `/` separated names.
//!
//! All reads go through bus DMA into a bounce buffer in RAM.
use crate::{Console, dma::DmaError, system::cart::CART_BASE};
use easyerr::{Error, ResultExt};
use std::io::SeekFrom;
use util::{Address, align_up};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, big_endian::U32};

pub const MAGIC: [u8; 4] = *b"QFS1";

/// Longest name an entry can have, in bytes.
pub const MAX_NAME_LEN: usize = 63;

/// How many files can be open at once.
pub const MAX_OPEN_FILES: usize = 16;

/// Alignment of file data within an archive.
const DATA_ALIGNMENT: u32 = 8;

const BOUNCE_LEN: u32 = 4 * bytesize::KIB as u32;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawHeader {
    magic: [u8; 4],
    count: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawEntry {
    name: [u8; MAX_NAME_LEN + 1],
    offset: U32,
    size: U32,
}

const HEADER_LEN: u32 = size_of::<RawHeader>() as u32;
const ENTRY_LEN: u32 = size_of::<RawEntry>() as u32;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no archive is mounted")]
    NotMounted,
    #[error("an archive is already mounted")]
    AlreadyMounted,
    #[error("archive has a bad magic")]
    BadMagic,
    #[error("archive is truncated")]
    Truncated,
    #[error("no entry named {f0:?}")]
    NotFound(String),
    #[error("file handle is not open")]
    BadHandle,
    #[error("at most 16 files can be open at once")]
    TooManyOpenFiles,
    #[error("seek to {f0} is outside of the file")]
    SeekOutOfRange(i64),
    #[error("out of RAM for the bounce buffer")]
    OutOfMemory,
    #[error("name {f0:?} is longer than 63 bytes")]
    NameTooLong(String),
    #[error(transparent)]
    Dma { source: DmaError },
}

/// An open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(usize);

/// An entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Size in bytes, zero for directories.
    pub size: u32,
    pub is_dir: bool,
}

#[derive(Debug)]
struct Entry {
    name: String,
    offset: u32,
    size: u32,
}

#[derive(Debug, Clone, Copy)]
struct OpenFile {
    entry: usize,
    pos: u32,
}

/// A mounted archive.
#[derive(Debug)]
pub(crate) struct Mount {
    base: Address,
    entries: Vec<Entry>,
    files: Vec<Option<OpenFile>>,
    bounce: Address,
}

impl Mount {
    fn file(&self, handle: FileHandle) -> Result<OpenFile, FsError> {
        self.files
            .get(handle.0)
            .copied()
            .flatten()
            .ok_or(FsError::BadHandle)
    }

    fn file_mut(&mut self, handle: FileHandle) -> Result<&mut OpenFile, FsError> {
        self.files
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadHandle)
    }
}

/// Strips the device prefix and surrounding slashes.
fn normalize(path: &str) -> &str {
    let path = path.strip_prefix("rom:").unwrap_or(path);
    path.trim_matches('/')
}

impl Console {
    /// Copies from the bus through the bounce buffer.
    fn fs_copy(&mut self, bounce: Address, bus: Address, out: &mut [u8]) -> Result<(), FsError> {
        for (i, chunk) in out.chunks_mut(BOUNCE_LEN as usize).enumerate() {
            let offset = i as u32 * BOUNCE_LEN;
            let len = chunk.len() as u32;
            self.dma_read_raw(bounce, bus + offset, len)
                .context(FsCtx::Dma)?;

            let Some(src) = self.ram(bounce.span(len)) else {
                return Err(FsError::OutOfMemory);
            };
            chunk.copy_from_slice(src);
        }

        Ok(())
    }

    fn read_table(&mut self, bounce: Address, base: Address) -> Result<Vec<Entry>, FsError> {
        let mut header = RawHeader::new_zeroed();
        self.fs_copy(bounce, base, header.as_mut_bytes())?;
        if header.magic != MAGIC {
            return Err(FsError::BadMagic);
        }

        let count = header.count.get();
        let available = (self.system.cart.len() as u64).saturating_sub((base - CART_BASE) as u64);
        if HEADER_LEN as u64 + count as u64 * ENTRY_LEN as u64 > available {
            return Err(FsError::Truncated);
        }

        let mut table = vec![0; (count * ENTRY_LEN) as usize];
        self.fs_copy(bounce, base + HEADER_LEN, &mut table)?;

        let entries = table
            .chunks_exact(ENTRY_LEN as usize)
            .filter_map(|bytes| RawEntry::read_from_bytes(bytes).ok())
            .map(|raw| {
                let end = raw.name.iter().position(|b| *b == 0).unwrap_or(raw.name.len());
                Entry {
                    name: String::from_utf8_lossy(&raw.name[..end]).into_owned(),
                    offset: raw.offset.get(),
                    size: raw.size.get(),
                }
            })
            .collect();

        Ok(entries)
    }

    /// Mounts the archive at `base_offset` bytes into the cartridge. Returns the number of
    /// entries.
    pub fn fs_init(&mut self, base_offset: u32) -> Result<usize, FsError> {
        if self.fs.is_some() {
            return Err(FsError::AlreadyMounted);
        }

        let Some(bounce) = self.alloc(BOUNCE_LEN) else {
            return Err(FsError::OutOfMemory);
        };

        let base = CART_BASE + base_offset;
        let entries = match self.read_table(bounce, base) {
            Ok(entries) => entries,
            Err(e) => {
                self.free(bounce);
                return Err(e);
            }
        };

        tracing::info!(%base, entries = entries.len(), "mounted archive");
        let count = entries.len();
        self.fs = Some(Mount {
            base,
            entries,
            files: Vec::new(),
            bounce,
        });

        Ok(count)
    }

    /// Unmounts the archive, closing every file.
    pub fn fs_unmount(&mut self) -> Result<(), FsError> {
        let mount = self.fs.take().ok_or(FsError::NotMounted)?;
        self.free(mount.bounce);
        Ok(())
    }

    fn mount(&self) -> Result<&Mount, FsError> {
        self.fs.as_ref().ok_or(FsError::NotMounted)
    }

    fn mount_mut(&mut self) -> Result<&mut Mount, FsError> {
        self.fs.as_mut().ok_or(FsError::NotMounted)
    }

    pub fn fs_open(&mut self, path: &str) -> Result<FileHandle, FsError> {
        let mount = self.mount_mut()?;
        let name = normalize(path);
        let Some(entry) = mount.entries.iter().position(|e| e.name == name) else {
            return Err(FsError::NotFound(path.to_owned()));
        };

        let file = Some(OpenFile { entry, pos: 0 });
        let index = match mount.files.iter().position(Option::is_none) {
            Some(index) => {
                mount.files[index] = file;
                index
            }
            None if mount.files.len() < MAX_OPEN_FILES => {
                mount.files.push(file);
                mount.files.len() - 1
            }
            None => return Err(FsError::TooManyOpenFiles),
        };

        Ok(FileHandle(index))
    }

    /// Reads from the current position. Returns how many bytes were read, zero at the end of
    /// the file.
    pub fn fs_read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize, FsError> {
        let mount = self.mount()?;
        let file = mount.file(handle)?;
        let entry = &mount.entries[file.entry];

        let remaining = entry.size - file.pos;
        let len = remaining.min(buf.len() as u32);
        if len == 0 {
            return Ok(0);
        }

        let bus = mount.base + entry.offset + file.pos;
        let bounce = mount.bounce;
        self.fs_copy(bounce, bus, &mut buf[..len as usize])?;

        self.mount_mut()?.file_mut(handle)?.pos += len;
        Ok(len as usize)
    }

    /// Moves the position. Seeking past the end is an error.
    pub fn fs_seek(&mut self, handle: FileHandle, pos: SeekFrom) -> Result<u32, FsError> {
        let mount = self.mount_mut()?;
        let file = mount.file(handle)?;
        let size = mount.entries[file.entry].size as i64;

        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => file.pos as i64 + delta,
            SeekFrom::End(delta) => size + delta,
        };

        if !(0..=size).contains(&target) {
            return Err(FsError::SeekOutOfRange(target));
        }

        mount.file_mut(handle)?.pos = target as u32;
        Ok(target as u32)
    }

    pub fn fs_tell(&self, handle: FileHandle) -> Result<u32, FsError> {
        Ok(self.mount()?.file(handle)?.pos)
    }

    pub fn fs_size(&self, handle: FileHandle) -> Result<u32, FsError> {
        let mount = self.mount()?;
        let file = mount.file(handle)?;
        Ok(mount.entries[file.entry].size)
    }

    pub fn fs_close(&mut self, handle: FileHandle) -> Result<(), FsError> {
        let mount = self.mount_mut()?;
        mount.file(handle)?;
        mount.files[handle.0] = None;
        Ok(())
    }

    /// Lists the direct children of a directory. The root is `""` or `"/"`.
    pub fn fs_read_dir(&self, dir: &str) -> Result<Vec<DirEntry>, FsError> {
        let mount = self.mount()?;
        let dir = normalize(dir);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };

        let mut listing: Vec<DirEntry> = Vec::new();
        for entry in &mount.entries {
            let Some(rest) = entry.name.strip_prefix(&prefix) else {
                continue;
            };

            let child = match rest.split_once('/') {
                Some((name, _)) => DirEntry {
                    name: name.to_owned(),
                    size: 0,
                    is_dir: true,
                },
                None => DirEntry {
                    name: rest.to_owned(),
                    size: entry.size,
                    is_dir: false,
                },
            };

            if !listing.iter().any(|e| e.name == child.name) {
                listing.push(child);
            }
        }

        if listing.is_empty() && !dir.is_empty() {
            return Err(FsError::NotFound(dir.to_owned()));
        }

        Ok(listing)
    }
}

/// Builds archive images.
#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    files: Vec<(String, Vec<u8>)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        name: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Result<&mut Self, FsError> {
        let name = name.into();
        let normalized = normalize(&name).to_owned();
        if normalized.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong(name));
        }

        self.files.push((normalized, data.into()));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn build(&self) -> Vec<u8> {
        let table_end = HEADER_LEN + self.files.len() as u32 * ENTRY_LEN;

        let mut entries = Vec::with_capacity(self.files.len());
        let mut offset = align_up(table_end, DATA_ALIGNMENT);
        for (name, data) in &self.files {
            let mut raw = RawEntry {
                name: [0; MAX_NAME_LEN + 1],
                offset: U32::new(offset),
                size: U32::new(data.len() as u32),
            };
            raw.name[..name.len()].copy_from_slice(name.as_bytes());
            entries.push(raw);

            offset = align_up(offset + data.len() as u32, DATA_ALIGNMENT);
        }

        let mut image = Vec::with_capacity(offset as usize);
        let header = RawHeader {
            magic: MAGIC,
            count: U32::new(self.files.len() as u32),
        };
        image.extend_from_slice(header.as_bytes());
        for entry in &entries {
            image.extend_from_slice(entry.as_bytes());
        }

        for ((_, data), entry) in self.files.iter().zip(&entries) {
            image.resize(entry.offset.get() as usize, 0);
            image.extend_from_slice(data);
        }

        image.resize(offset as usize, 0);
        image
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Config, modules::Modules};

    const ARCHIVE_OFFSET: u32 = 0x100;

    fn big() -> Vec<u8> {
        (0..10_000u32).map(|i| (i % 251) as u8).collect()
    }

    fn console() -> Console {
        let mut builder = ArchiveBuilder::new();
        builder
            .add("hello.txt", b"hello, world".to_vec())
            .unwrap()
            .add("/data/big.bin", big())
            .unwrap()
            .add("data/levels/1.lvl", vec![1; 33])
            .unwrap()
            .add("data/levels/2.lvl", vec![2; 17])
            .unwrap();

        let mut cartridge = vec![0xFF; ARCHIVE_OFFSET as usize];
        cartridge.extend(builder.build());

        Console::new(
            Modules::default(),
            Config {
                cartridge,
                poll_cycles: 512,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn read_whole_files() {
        let mut console = console();
        assert_eq!(console.fs_init(ARCHIVE_OFFSET).unwrap(), 4);
        assert!(matches!(
            console.fs_init(ARCHIVE_OFFSET),
            Err(FsError::AlreadyMounted)
        ));

        let file = console.fs_open("rom:/hello.txt").unwrap();
        assert_eq!(console.fs_size(file).unwrap(), 12);

        let mut buf = [0; 64];
        assert_eq!(console.fs_read(file, &mut buf).unwrap(), 12);
        assert_eq!(&buf[..12], b"hello, world");
        assert_eq!(console.fs_read(file, &mut buf).unwrap(), 0);
        console.fs_close(file).unwrap();

        // spans several bounce buffers
        let file = console.fs_open("data/big.bin").unwrap();
        let mut data = vec![0; 10_000];
        assert_eq!(console.fs_read(file, &mut data).unwrap(), 10_000);
        assert_eq!(data, big());
    }

    #[test]
    fn seek_and_tell() {
        let mut console = console();
        console.fs_init(ARCHIVE_OFFSET).unwrap();
        let file = console.fs_open("data/big.bin").unwrap();

        assert_eq!(console.fs_seek(file, SeekFrom::Start(5000)).unwrap(), 5000);
        assert_eq!(console.fs_seek(file, SeekFrom::Current(-1)).unwrap(), 4999);
        assert_eq!(console.fs_tell(file).unwrap(), 4999);

        let mut buf = [0; 3];
        console.fs_read(file, &mut buf).unwrap();
        assert_eq!(buf, [4999 % 251, 5000 % 251, 5001 % 251].map(|v| v as u8));
        assert_eq!(console.fs_tell(file).unwrap(), 5002);

        assert_eq!(console.fs_seek(file, SeekFrom::End(-2)).unwrap(), 9998);
        assert_eq!(console.fs_read(file, &mut buf).unwrap(), 2);

        assert!(matches!(
            console.fs_seek(file, SeekFrom::Current(1)),
            Err(FsError::SeekOutOfRange(10_001))
        ));
        assert!(matches!(
            console.fs_seek(file, SeekFrom::End(-10_001)),
            Err(FsError::SeekOutOfRange(-1))
        ));
    }

    #[test]
    fn directories() {
        let mut console = console();
        console.fs_init(ARCHIVE_OFFSET).unwrap();

        let root = console.fs_read_dir("/").unwrap();
        assert_eq!(
            root,
            vec![
                DirEntry {
                    name: "hello.txt".into(),
                    size: 12,
                    is_dir: false
                },
                DirEntry {
                    name: "data".into(),
                    size: 0,
                    is_dir: true
                },
            ]
        );

        let data = console.fs_read_dir("rom:/data/").unwrap();
        let names = data.iter().map(|e| e.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["big.bin", "levels"]);

        let levels = console.fs_read_dir("data/levels").unwrap();
        assert_eq!(levels.len(), 2);
        assert!(levels.iter().all(|e| !e.is_dir));

        assert!(matches!(
            console.fs_read_dir("nope"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn handles() {
        let mut console = console();
        assert!(matches!(console.fs_open("hello.txt"), Err(FsError::NotMounted)));
        console.fs_init(ARCHIVE_OFFSET).unwrap();

        assert!(matches!(
            console.fs_open("missing"),
            Err(FsError::NotFound(_))
        ));

        let file = console.fs_open("hello.txt").unwrap();
        console.fs_close(file).unwrap();
        assert!(matches!(console.fs_close(file), Err(FsError::BadHandle)));
        assert!(matches!(console.fs_tell(file), Err(FsError::BadHandle)));

        let files = (0..MAX_OPEN_FILES)
            .map(|_| console.fs_open("hello.txt").unwrap())
            .collect::<Vec<_>>();
        assert!(matches!(
            console.fs_open("hello.txt"),
            Err(FsError::TooManyOpenFiles)
        ));

        console.fs_close(files[3]).unwrap();
        assert_eq!(console.fs_open("hello.txt").unwrap(), files[3]);

        console.fs_unmount().unwrap();
        assert!(matches!(console.fs_size(files[0]), Err(FsError::NotMounted)));
    }

    #[test]
    fn bad_archives() {
        let mut console = console();
        assert!(matches!(console.fs_init(0), Err(FsError::BadMagic)));

        let mut image = b"QFS1".to_vec();
        image.extend_from_slice(&1000u32.to_be_bytes());
        let mut console = Console::new(
            Modules::default(),
            Config {
                cartridge: image,
                ..Default::default()
            },
        )
        .unwrap();
        let before = console.free_bytes();
        assert!(matches!(console.fs_init(0), Err(FsError::Truncated)));
        assert_eq!(console.free_bytes(), before);

        let mut builder = ArchiveBuilder::new();
        assert!(matches!(
            builder.add("x".repeat(64), Vec::new()),
            Err(FsError::NameTooLong(_))
        ));
        assert_eq!(builder.len(), 0);
    }
}
