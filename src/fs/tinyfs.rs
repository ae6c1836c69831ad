//! TinyFS - Simple Filesystem
//!
//! Disk layout (little-endian throughout):
//! - Sector 0:     superblock (magic "TFS!")
//! - Sectors 1-8:  FAT, 2048 16-bit entries
//! - Sectors 9-12: root directory, 64 x 32-byte entries
//! - Sector 13+:   data, allocated in clusters of 4 sectors (2 KiB)
//!
//! The FAT and root directory are cached in RAM at mount; every mutation is
//! written back (FAT, root directory, superblock) before returning.

use super::BlockDevice;

pub const FS_MAGIC: u32 = 0x5446_5321; // "TFS!"
pub const FS_VERSION: u32 = 1;

pub const MAX_FILENAME: usize = 20;
pub const MAX_FILES: usize = 64;
pub const MAX_OPEN: usize = 8;

pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_CLUSTER: u32 = 4;
pub const CLUSTER_SIZE: u32 = SECTORS_PER_CLUSTER * SECTOR_SIZE as u32;

const SUPERBLOCK_SECTOR: u64 = 0;
const FAT_START_SECTOR: u32 = 1;
const FAT_SECTORS: u32 = 8; // 8 * 512 bytes = 2048 16-bit entries
const ROOT_START_SECTOR: u32 = 9;
const ROOT_SECTORS: u32 = 4; // 64 entries * 32 bytes
const DATA_START_SECTOR: u32 = 13;

const MAX_CLUSTERS: usize = 2048;

// Reserved FAT values
pub const FAT_FREE: u16 = 0x0000;
pub const FAT_EOF: u16 = 0xFFFF;
pub const FAT_BAD: u16 = 0xFFF7;

// Open flags
pub const O_READ: u32 = 0x01;
pub const O_WRITE: u32 = 0x02;
pub const O_CREATE: u32 = 0x04;
pub const O_TRUNC: u32 = 0x08;
pub const O_APPEND: u32 = 0x10;

/// Directory flag bit: entry is a directory
pub const FLAG_DIR: u16 = 0x01;

/// Seek origin
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ON-DISK STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════════

/// 32-byte directory entry. `name[0] == 0` marks a free slot.
#[derive(Clone, Copy)]
pub struct DirEntry {
    pub name: [u8; MAX_FILENAME],
    pub size: u32,
    pub first_cluster: u16,
    pub flags: u16,
}

impl DirEntry {
    pub const EMPTY: DirEntry = DirEntry {
        name: [0; MAX_FILENAME],
        size: 0,
        first_cluster: 0,
        flags: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.name[0] == 0
    }

    pub fn is_dir(&self) -> bool {
        self.flags & FLAG_DIR != 0
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(MAX_FILENAME);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn name_matches(&self, name: &str) -> bool {
        !self.is_empty() && self.name_str() == name
    }

    fn set_name(&mut self, name: &str) {
        self.name = [0; MAX_FILENAME];
        for (i, b) in name.bytes().take(MAX_FILENAME - 1).enumerate() {
            self.name[i] = b;
        }
    }

    fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..MAX_FILENAME].copy_from_slice(&self.name);
        out[20..24].copy_from_slice(&self.size.to_le_bytes());
        out[24..26].copy_from_slice(&self.first_cluster.to_le_bytes());
        out[26..28].copy_from_slice(&self.flags.to_le_bytes());
        // bytes 28..32 reserved
        out
    }

    fn from_bytes(raw: &[u8]) -> DirEntry {
        let mut name = [0u8; MAX_FILENAME];
        name.copy_from_slice(&raw[..MAX_FILENAME]);
        DirEntry {
            name,
            size: u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]),
            first_cluster: u16::from_le_bytes([raw[24], raw[25]]),
            flags: u16::from_le_bytes([raw[26], raw[27]]),
        }
    }
}

/// Superblock, one sector
#[derive(Clone, Copy)]
struct Superblock {
    magic: u32,
    version: u32,
    total_sectors: u32,
    total_clusters: u32,
    free_clusters: u32,
    fat_start: u32,
    fat_sectors: u32,
    root_start: u32,
    root_sectors: u32,
    data_start: u32,
}

impl Superblock {
    const EMPTY: Superblock = Superblock {
        magic: 0,
        version: 0,
        total_sectors: 0,
        total_clusters: 0,
        free_clusters: 0,
        fat_start: 0,
        fat_sectors: 0,
        root_start: 0,
        root_sectors: 0,
        data_start: 0,
    };

    fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut out = [0u8; SECTOR_SIZE];
        let fields = [
            self.magic,
            self.version,
            self.total_sectors,
            self.total_clusters,
            self.free_clusters,
            self.fat_start,
            self.fat_sectors,
            self.root_start,
            self.root_sectors,
            self.data_start,
        ];
        for (i, f) in fields.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
        }
        out
    }

    fn from_bytes(raw: &[u8]) -> Superblock {
        let word = |i: usize| u32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]]);
        Superblock {
            magic: word(0),
            version: word(1),
            total_sectors: word(2),
            total_clusters: word(3),
            free_clusters: word(4),
            fat_start: word(5),
            fat_sectors: word(6),
            root_start: word(7),
            root_sectors: word(8),
            data_start: word(9),
        }
    }
}

/// Open-file table slot
#[derive(Clone, Copy)]
struct OpenFile {
    in_use: bool,
    dirent_idx: usize,
    size: u32,
    pos: u32,
    first_cluster: u16,
    flags: u32,
}

impl OpenFile {
    const CLOSED: OpenFile = OpenFile {
        in_use: false,
        dirent_idx: 0,
        size: 0,
        pos: 0,
        first_cluster: FAT_EOF,
        flags: 0,
    };
}

/// Filesystem statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsStats {
    pub total_clusters: u32,
    pub free_clusters: u32,
    pub cluster_size: u32,
    pub file_count: u32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// FILESYSTEM
// ═══════════════════════════════════════════════════════════════════════════════

pub struct TinyFs<D: BlockDevice> {
    dev: D,
    superblock: Superblock,
    fat: [u16; MAX_CLUSTERS],
    root: [DirEntry; MAX_FILES],
    open_files: [OpenFile; MAX_OPEN],
    mounted: bool,
    sector_buf: [u8; SECTOR_SIZE],
}

impl<D: BlockDevice> TinyFs<D> {
    pub fn new(dev: D) -> Self {
        TinyFs {
            dev,
            superblock: Superblock::EMPTY,
            fat: [FAT_FREE; MAX_CLUSTERS],
            root: [DirEntry::EMPTY; MAX_FILES],
            open_files: [OpenFile::CLOSED; MAX_OPEN],
            mounted: false,
            sector_buf: [0; SECTOR_SIZE],
        }
    }

    /// Tear down and return the underlying device
    pub fn into_device(self) -> D {
        self.dev
    }

    pub fn mounted(&self) -> bool {
        self.mounted
    }

    // ── persistence ──────────────────────────────────────────────────────────

    fn write_superblock(&mut self) -> Result<(), &'static str> {
        let bytes = self.superblock.to_bytes();
        self.dev.write(SUPERBLOCK_SECTOR, 1, &bytes)
    }

    fn write_fat(&mut self) -> Result<(), &'static str> {
        let mut bytes = [0u8; (FAT_SECTORS as usize) * SECTOR_SIZE];
        for (i, entry) in self.fat.iter().enumerate() {
            bytes[i * 2..i * 2 + 2].copy_from_slice(&entry.to_le_bytes());
        }
        self.dev.write(FAT_START_SECTOR as u64, FAT_SECTORS, &bytes)
    }

    fn write_root(&mut self) -> Result<(), &'static str> {
        let mut bytes = [0u8; (ROOT_SECTORS as usize) * SECTOR_SIZE];
        for (i, entry) in self.root.iter().enumerate() {
            bytes[i * 32..i * 32 + 32].copy_from_slice(&entry.to_bytes());
        }
        self.dev.write(ROOT_START_SECTOR as u64, ROOT_SECTORS, &bytes)
    }

    fn persist_metadata(&mut self) -> Result<(), &'static str> {
        self.write_fat()?;
        self.write_root()?;
        self.write_superblock()
    }

    // ── mount / format ───────────────────────────────────────────────────────

    /// Read the superblock and cache the FAT and root directory. A bad
    /// magic/version leaves the filesystem unmounted but is not an error;
    /// the disk is simply unformatted.
    pub fn mount(&mut self) -> Result<(), &'static str> {
        self.open_files = [OpenFile::CLOSED; MAX_OPEN];
        self.mounted = false;

        let mut sb_buf = [0u8; SECTOR_SIZE];
        self.dev.read(SUPERBLOCK_SECTOR, 1, &mut sb_buf)?;
        let sb = Superblock::from_bytes(&sb_buf);

        if sb.magic != FS_MAGIC || sb.version != FS_VERSION {
            return Ok(());
        }
        self.superblock = sb;

        let mut fat_buf = [0u8; (FAT_SECTORS as usize) * SECTOR_SIZE];
        self.dev.read(FAT_START_SECTOR as u64, FAT_SECTORS, &mut fat_buf)?;
        for i in 0..MAX_CLUSTERS {
            self.fat[i] = u16::from_le_bytes([fat_buf[i * 2], fat_buf[i * 2 + 1]]);
        }

        let mut root_buf = [0u8; (ROOT_SECTORS as usize) * SECTOR_SIZE];
        self.dev.read(ROOT_START_SECTOR as u64, ROOT_SECTORS, &mut root_buf)?;
        for i in 0..MAX_FILES {
            self.root[i] = DirEntry::from_bytes(&root_buf[i * 32..i * 32 + 32]);
        }

        self.mounted = true;
        Ok(())
    }

    /// Write a fresh filesystem onto the device
    pub fn format(&mut self) -> Result<(), &'static str> {
        let total_sectors = self.dev.capacity() as u32;
        if total_sectors < 32 {
            return Err("disk too small");
        }

        let data_sectors = total_sectors - DATA_START_SECTOR;
        let mut total_clusters = data_sectors / SECTORS_PER_CLUSTER;
        if total_clusters > MAX_CLUSTERS as u32 {
            total_clusters = MAX_CLUSTERS as u32;
        }

        self.superblock = Superblock {
            magic: FS_MAGIC,
            version: FS_VERSION,
            total_sectors,
            total_clusters,
            free_clusters: total_clusters - 1, // cluster 0 is reserved
            fat_start: FAT_START_SECTOR,
            fat_sectors: FAT_SECTORS,
            root_start: ROOT_START_SECTOR,
            root_sectors: ROOT_SECTORS,
            data_start: DATA_START_SECTOR,
        };

        self.fat = [FAT_FREE; MAX_CLUSTERS];
        self.fat[0] = FAT_EOF;
        self.root = [DirEntry::EMPTY; MAX_FILES];
        self.open_files = [OpenFile::CLOSED; MAX_OPEN];

        self.write_superblock()?;
        self.write_fat()?;
        self.write_root()?;
        self.dev.flush()?;

        self.mounted = true;
        Ok(())
    }

    // ── cluster management ───────────────────────────────────────────────────

    fn cluster_to_sector(&self, cluster: u16) -> u64 {
        self.superblock.data_start as u64 + cluster as u64 * SECTORS_PER_CLUSTER as u64
    }

    /// First-fit cluster allocation; cluster 0 is never handed out
    fn alloc_cluster(&mut self) -> Option<u16> {
        for i in 1..self.superblock.total_clusters as usize {
            if self.fat[i] == FAT_FREE {
                self.fat[i] = FAT_EOF;
                self.superblock.free_clusters -= 1;
                return Some(i as u16);
            }
        }
        None
    }

    fn free_cluster_chain(&mut self, start: u16) {
        let mut cluster = start;
        while cluster != FAT_EOF && cluster != FAT_FREE && (cluster as usize) < MAX_CLUSTERS {
            let next = self.fat[cluster as usize];
            self.fat[cluster as usize] = FAT_FREE;
            self.superblock.free_clusters += 1;
            cluster = next;
        }
    }

    // ── directory ────────────────────────────────────────────────────────────

    fn find_file(&self, name: &str) -> Option<usize> {
        self.root.iter().position(|e| e.name_matches(name))
    }

    fn find_free_dirent(&self) -> Option<usize> {
        self.root.iter().position(|e| e.is_empty())
    }

    fn strip_path(path: &str) -> Result<&str, &'static str> {
        let name = path.strip_prefix('/').unwrap_or(path);
        if name.is_empty() {
            return Err("cannot open root as a file");
        }
        Ok(name)
    }

    // ── open files ───────────────────────────────────────────────────────────

    /// Open (and possibly create or truncate) a file. Returns a descriptor
    /// for the fixed open-file table.
    pub fn open(&mut self, path: &str, flags: u32) -> Result<usize, &'static str> {
        if !self.mounted {
            return Err("filesystem not mounted");
        }
        let name = Self::strip_path(path)?;

        let fd = self
            .open_files
            .iter()
            .position(|f| !f.in_use)
            .ok_or("too many open files")?;

        let idx = match self.find_file(name) {
            Some(idx) => {
                if flags & O_TRUNC != 0 && self.root[idx].first_cluster != FAT_EOF {
                    let first = self.root[idx].first_cluster;
                    self.free_cluster_chain(first);
                    self.root[idx].first_cluster = FAT_EOF;
                    self.root[idx].size = 0;
                    self.write_fat()?;
                    self.write_root()?;
                }
                idx
            }
            None => {
                if flags & O_CREATE == 0 {
                    return Err("file not found");
                }
                let idx = self.find_free_dirent().ok_or("directory full")?;
                let mut entry = DirEntry::EMPTY;
                entry.set_name(name);
                entry.first_cluster = FAT_EOF;
                self.root[idx] = entry;
                if self.write_root().is_err() {
                    self.root[idx] = DirEntry::EMPTY;
                    return Err("directory write failed");
                }
                idx
            }
        };

        let size = self.root[idx].size;
        self.open_files[fd] = OpenFile {
            in_use: true,
            dirent_idx: idx,
            size,
            pos: if flags & O_APPEND != 0 { size } else { 0 },
            first_cluster: self.root[idx].first_cluster,
            flags,
        };

        Ok(fd)
    }

    pub fn close(&mut self, fd: usize) -> Result<(), &'static str> {
        self.file(fd)?;
        self.open_files[fd].in_use = false;
        Ok(())
    }

    fn file(&self, fd: usize) -> Result<&OpenFile, &'static str> {
        self.open_files
            .get(fd)
            .filter(|f| f.in_use)
            .ok_or("bad file descriptor")
    }

    pub fn size(&self, fd: usize) -> Result<u32, &'static str> {
        Ok(self.file(fd)?.size)
    }

    /// Seek within an open file. The position is clamped at zero and may
    /// point past the end; that does not extend the file.
    pub fn seek(&mut self, fd: usize, offset: i64, whence: Whence) -> Result<u32, &'static str> {
        let f = *self.file(fd)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => f.pos as i64,
            Whence::End => f.size as i64,
        };
        let new_pos = (base + offset).max(0) as u32;
        self.open_files[fd].pos = new_pos;
        Ok(new_pos)
    }

    /// Read from the current position, stopping cleanly at the file size.
    pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize, &'static str> {
        let f = *self.file(fd)?;
        if f.flags & O_READ == 0 {
            return Err("file not open for reading");
        }

        let mut remaining = buf.len();
        let mut out = 0usize;
        let mut pos = f.pos;

        while remaining > 0 && pos < f.size {
            let cluster_num = pos / CLUSTER_SIZE;
            let cluster_offset = pos % CLUSTER_SIZE;

            // Walk the chain to the cluster holding this offset
            let mut cluster = f.first_cluster;
            for _ in 0..cluster_num {
                if cluster == FAT_EOF {
                    break;
                }
                cluster = self.fat[cluster as usize];
            }
            if cluster == FAT_EOF || cluster == FAT_FREE {
                break;
            }

            let sector_in_cluster = cluster_offset / SECTOR_SIZE as u32;
            let sector_offset = (cluster_offset % SECTOR_SIZE as u32) as usize;
            let sector = self.cluster_to_sector(cluster) + sector_in_cluster as u64;

            if self.dev.read(sector, 1, &mut self.sector_buf).is_err() {
                return if out > 0 { Ok(out) } else { Err("disk read error") };
            }

            let mut to_copy = SECTOR_SIZE - sector_offset;
            if to_copy > remaining {
                to_copy = remaining;
            }
            if pos + to_copy as u32 > f.size {
                to_copy = (f.size - pos) as usize;
            }

            buf[out..out + to_copy]
                .copy_from_slice(&self.sector_buf[sector_offset..sector_offset + to_copy]);
            out += to_copy;
            pos += to_copy as u32;
            remaining -= to_copy;
        }

        self.open_files[fd].pos = pos;
        Ok(out)
    }

    /// Write at the current position, allocating clusters as the chain runs
    /// out. Returns a short count only when allocation fails mid-write.
    pub fn write(&mut self, fd: usize, buf: &[u8]) -> Result<usize, &'static str> {
        let f = *self.file(fd)?;
        if f.flags & O_WRITE == 0 {
            return Err("file not open for writing");
        }

        let idx = f.dirent_idx;
        let mut first_cluster = f.first_cluster;
        let mut size = f.size;
        let mut pos = f.pos;
        let mut remaining = buf.len();
        let mut written = 0usize;

        while remaining > 0 {
            let cluster_num = pos / CLUSTER_SIZE;
            let cluster_offset = pos % CLUSTER_SIZE;

            // Allocate the first cluster of an empty file
            let mut cluster = first_cluster;
            if cluster == FAT_EOF {
                match self.alloc_cluster() {
                    Some(c) => {
                        cluster = c;
                        first_cluster = c;
                        self.root[idx].first_cluster = c;
                    }
                    None => break,
                }
            }

            // Walk (and extend) the chain to the target cluster
            let mut alloc_failed = false;
            for _ in 0..cluster_num {
                if self.fat[cluster as usize] == FAT_EOF {
                    match self.alloc_cluster() {
                        Some(c) => self.fat[cluster as usize] = c,
                        None => {
                            alloc_failed = true;
                            break;
                        }
                    }
                }
                cluster = self.fat[cluster as usize];
            }
            if alloc_failed {
                break;
            }

            let sector_in_cluster = cluster_offset / SECTOR_SIZE as u32;
            let sector_offset = (cluster_offset % SECTOR_SIZE as u32) as usize;
            let sector = self.cluster_to_sector(cluster) + sector_in_cluster as u64;

            // Read-modify-write unless we overwrite the full sector
            if sector_offset != 0 || remaining < SECTOR_SIZE {
                if self.dev.read(sector, 1, &mut self.sector_buf).is_err() {
                    self.sector_buf = [0; SECTOR_SIZE];
                }
            }

            let mut to_copy = SECTOR_SIZE - sector_offset;
            if to_copy > remaining {
                to_copy = remaining;
            }

            self.sector_buf[sector_offset..sector_offset + to_copy]
                .copy_from_slice(&buf[written..written + to_copy]);

            if self.dev.write(sector, 1, &self.sector_buf).is_err() {
                break;
            }

            written += to_copy;
            pos += to_copy as u32;
            remaining -= to_copy;

            if pos > size {
                size = pos;
                self.root[idx].size = size;
            }
        }

        self.open_files[fd].first_cluster = first_cluster;
        self.open_files[fd].size = size;
        self.open_files[fd].pos = pos;

        self.persist_metadata()?;

        if written == 0 && !buf.is_empty() {
            return Err("no space");
        }
        Ok(written)
    }

    // ── directory operations ─────────────────────────────────────────────────

    /// Enumerate non-empty root entries into `entries`; returns the count
    pub fn readdir(&self, entries: &mut [DirEntry]) -> Result<usize, &'static str> {
        if !self.mounted {
            return Err("filesystem not mounted");
        }
        let mut count = 0;
        for entry in self.root.iter() {
            if count >= entries.len() {
                break;
            }
            if !entry.is_empty() {
                entries[count] = *entry;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Delete a file. Fails while the file is open.
    pub fn remove(&mut self, path: &str) -> Result<(), &'static str> {
        if !self.mounted {
            return Err("filesystem not mounted");
        }
        let name = Self::strip_path(path)?;
        let idx = self.find_file(name).ok_or("file not found")?;

        if self.open_files.iter().any(|f| f.in_use && f.dirent_idx == idx) {
            return Err("file is open");
        }

        if self.root[idx].first_cluster != FAT_EOF {
            let first = self.root[idx].first_cluster;
            self.free_cluster_chain(first);
        }
        self.root[idx] = DirEntry::EMPTY;

        self.persist_metadata()
    }

    pub fn stats(&self) -> Result<FsStats, &'static str> {
        if !self.mounted {
            return Err("filesystem not mounted");
        }
        Ok(FsStats {
            total_clusters: self.superblock.total_clusters,
            free_clusters: self.superblock.free_clusters,
            cluster_size: CLUSTER_SIZE,
            file_count: self.root.iter().filter(|e| !e.is_empty()).count() as u32,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemDisk;

    fn fresh_fs(sectors: usize) -> TinyFs<MemDisk> {
        let mut fs = TinyFs::new(MemDisk::new(sectors));
        fs.format().unwrap();
        fs
    }

    #[test]
    fn test_unformatted_disk_mounts_as_unmounted() {
        let mut fs = TinyFs::new(MemDisk::new(256));
        fs.mount().unwrap();
        assert!(!fs.mounted());
        assert!(fs.open("a", O_READ).is_err());
    }

    #[test]
    fn test_format_small_disk_fails() {
        let mut fs = TinyFs::new(MemDisk::new(31));
        assert!(fs.format().is_err());
    }

    #[test]
    fn test_small_file_roundtrip() {
        let mut fs = fresh_fs(256);

        let fd = fs.open("a", O_WRITE | O_CREATE).unwrap();
        assert_eq!(fs.write(fd, b"hello").unwrap(), 5);
        fs.close(fd).unwrap();

        let fd2 = fs.open("a", O_READ).unwrap();
        assert_eq!(fs.size(fd2).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(fs.read(fd2, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        // A second read hits EOF cleanly
        assert_eq!(fs.read(fd2, &mut buf).unwrap(), 0);
        fs.close(fd2).unwrap();
    }

    #[test]
    fn test_persists_across_remount() {
        let mut fs = fresh_fs(256);
        let fd = fs.open("keep.txt", O_WRITE | O_CREATE).unwrap();
        fs.write(fd, b"durable data").unwrap();
        fs.close(fd).unwrap();

        let disk = fs.into_device();
        let mut fs2 = TinyFs::new(disk);
        fs2.mount().unwrap();
        assert!(fs2.mounted());

        let fd = fs2.open("keep.txt", O_READ).unwrap();
        let mut buf = [0u8; 32];
        let n = fs2.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"durable data");
    }

    #[test]
    fn test_multi_cluster_file() {
        let mut fs = fresh_fs(512);
        let free_before = fs.stats().unwrap().free_clusters;

        // 5000 bytes spans three 2 KiB clusters
        let data: alloc::vec::Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let fd = fs.open("big", O_WRITE | O_CREATE).unwrap();
        assert_eq!(fs.write(fd, &data).unwrap(), 5000);
        fs.close(fd).unwrap();

        assert_eq!(fs.stats().unwrap().free_clusters, free_before - 3);

        let fd = fs.open("big", O_READ).unwrap();
        let mut buf = alloc::vec![0u8; 5000];
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 5000);
        assert_eq!(buf, data);
        fs.close(fd).unwrap();

        fs.remove("big").unwrap();
        assert_eq!(fs.stats().unwrap().free_clusters, free_before);
    }

    #[test]
    fn test_open_missing_without_create_fails() {
        let mut fs = fresh_fs(256);
        assert!(fs.open("nope", O_READ).is_err());
    }

    #[test]
    fn test_remove_hides_from_readdir() {
        let mut fs = fresh_fs(256);
        for name in ["a", "b", "c"] {
            let fd = fs.open(name, O_WRITE | O_CREATE).unwrap();
            fs.write(fd, b"x").unwrap();
            fs.close(fd).unwrap();
        }

        fs.remove("b").unwrap();

        let mut entries = [DirEntry::EMPTY; 16];
        let count = fs.readdir(&mut entries).unwrap();
        assert_eq!(count, 2);
        assert!(entries[..count].iter().all(|e| e.name_str() != "b"));
    }

    #[test]
    fn test_remove_open_file_fails() {
        let mut fs = fresh_fs(256);
        let fd = fs.open("busy", O_WRITE | O_CREATE).unwrap();
        assert!(fs.remove("busy").is_err());
        fs.close(fd).unwrap();
        fs.remove("busy").unwrap();
    }

    #[test]
    fn test_trunc_discards_content() {
        let mut fs = fresh_fs(256);
        let fd = fs.open("t", O_WRITE | O_CREATE).unwrap();
        fs.write(fd, b"some content").unwrap();
        fs.close(fd).unwrap();

        let fd = fs.open("t", O_WRITE | O_TRUNC).unwrap();
        assert_eq!(fs.size(fd).unwrap(), 0);
        fs.close(fd).unwrap();

        let fd = fs.open("t", O_READ).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 0);
        fs.close(fd).unwrap();
    }

    #[test]
    fn test_append_positions_at_end() {
        let mut fs = fresh_fs(256);
        let fd = fs.open("log", O_WRITE | O_CREATE).unwrap();
        fs.write(fd, b"one").unwrap();
        fs.close(fd).unwrap();

        let fd = fs.open("log", O_WRITE | O_APPEND).unwrap();
        fs.write(fd, b"two").unwrap();
        fs.close(fd).unwrap();

        let fd = fs.open("log", O_READ).unwrap();
        let mut buf = [0u8; 8];
        let n = fs.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"onetwo");
    }

    #[test]
    fn test_seek_semantics() {
        let mut fs = fresh_fs(256);
        let fd = fs.open("s", O_READ | O_WRITE | O_CREATE).unwrap();
        fs.write(fd, b"0123456789").unwrap();

        assert_eq!(fs.seek(fd, 0, Whence::End).unwrap(), 10);
        assert_eq!(fs.seek(fd, -4, Whence::End).unwrap(), 6);
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"6789");

        // Clamped at zero
        assert_eq!(fs.seek(fd, -100, Whence::Cur).unwrap(), 0);

        // Seeking past the end does not extend the file
        assert_eq!(fs.seek(fd, 100, Whence::Set).unwrap(), 100);
        assert_eq!(fs.size(fd).unwrap(), 10);
        fs.close(fd).unwrap();
    }

    #[test]
    fn test_write_past_eof_extends() {
        let mut fs = fresh_fs(256);
        let fd = fs.open("gap", O_READ | O_WRITE | O_CREATE).unwrap();
        fs.write(fd, b"hello").unwrap();
        fs.seek(fd, 100, Whence::Set).unwrap();
        assert_eq!(fs.write(fd, b"world").unwrap(), 5);
        assert_eq!(fs.size(fd).unwrap(), 105);
        fs.close(fd).unwrap();
    }

    #[test]
    fn test_open_file_table_limit() {
        let mut fs = fresh_fs(256);
        let mut fds = alloc::vec::Vec::new();
        for i in 0..MAX_OPEN {
            let mut name = alloc::string::String::from("f");
            name.push((b'0' + i as u8) as char);
            fds.push(fs.open(&name, O_WRITE | O_CREATE).unwrap());
        }
        assert!(fs.open("onemore", O_WRITE | O_CREATE).is_err());
        // Descriptors are reusable after close
        fs.close(fds[0]).unwrap();
        assert!(fs.open("onemore", O_WRITE | O_CREATE).is_ok());
    }

    #[test]
    fn test_no_free_clusters_gives_short_count() {
        // 13 metadata sectors + 8 clusters of data
        let mut fs = fresh_fs(13 + 32);
        let stats = fs.stats().unwrap();
        assert_eq!(stats.total_clusters, 8);
        assert_eq!(stats.free_clusters, 7);

        let fd = fs.open("fill", O_WRITE | O_CREATE).unwrap();
        let data = alloc::vec![0xAAu8; 8 * 2048];
        let written = fs.write(fd, &data).unwrap();
        // Only 7 usable clusters exist
        assert_eq!(written, 7 * 2048);
        fs.close(fd).unwrap();
    }
}
