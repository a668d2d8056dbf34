// =============================================================================
// raspvisor - Guest Image Store
// =============================================================================
// FAT volume holding the guest binaries. The firmware preloads the volume
// into RAM (`initramfs guests.img 0x02000000` in config.txt) and the store
// reads it through `fatfs` as a byte-addressed block device.
// =============================================================================

use alloc::string::String;
use alloc::vec::Vec;

use fatfs::{FileSystem, FsOptions, IoBase, Read, ReadWriteSeek, Seek, SeekFrom, Write};

use crate::loader::{ImageSource, LoadError};

// =============================================================================
// RAM Disk
// =============================================================================

/// A memory window seen as a seekable block device.
pub struct RamDisk<'a> {
    data: &'a mut [u8],
    pos: u64,
}

impl<'a> RamDisk<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes between the cursor and the end of the disk.
    fn window(&self, want: usize) -> (usize, usize) {
        let start = (self.pos as usize).min(self.data.len());
        let n = want.min(self.data.len() - start);
        (start, n)
    }
}

impl RamDisk<'static> {
    /// # Safety
    /// `[base, base + size)` must be RAM that nothing else touches while the
    /// disk is alive.
    pub unsafe fn from_raw(base: usize, size: usize) -> Self {
        Self::new(core::slice::from_raw_parts_mut(base as *mut u8, size))
    }
}

impl IoBase for RamDisk<'_> {
    type Error = ();
}

impl Read for RamDisk<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let (start, n) = self.window(buf.len());
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for RamDisk<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let (start, n) = self.window(buf.len());
        self.data[start..start + n].copy_from_slice(&buf[..n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Seek for RamDisk<'_> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, Self::Error> {
        let new = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(off) => self.pos as i64 + off,
            SeekFrom::End(off) => self.data.len() as i64 + off,
        };
        if new < 0 {
            return Err(());
        }
        self.pos = new as u64;
        Ok(self.pos)
    }
}

// =============================================================================
// Image Store
// =============================================================================

/// Guest images in the root directory of a FAT volume.
pub struct FatImageStore<IO: ReadWriteSeek> {
    fs: FileSystem<IO>,
}

impl<IO: ReadWriteSeek> FatImageStore<IO> {
    /// Mount the volume.
    pub fn new(io: IO) -> Result<Self, LoadError> {
        match FileSystem::new(io, FsOptions::new()) {
            Ok(fs) => {
                log::info!("fs: FAT volume mounted ({:?})", fs.fat_type());
                Ok(Self { fs })
            }
            Err(e) => {
                log::error!("fs: failed to mount image volume: {:?}", e);
                Err(LoadError::Storage)
            }
        }
    }

    /// Names and sizes of the files in the root directory.
    pub fn list(&self) -> Result<Vec<(String, u64)>, LoadError> {
        let mut files = Vec::new();
        for entry in self.fs.root_dir().iter() {
            let entry = entry.map_err(|_| LoadError::Storage)?;
            if entry.is_file() {
                files.push((entry.file_name(), entry.len()));
            }
        }
        Ok(files)
    }
}

impl<IO: ReadWriteSeek> ImageSource for FatImageStore<IO> {
    fn read_image(&mut self, name: &str) -> Result<Vec<u8>, LoadError> {
        let mut file = self.fs.root_dir().open_file(name).map_err(|e| match e {
            fatfs::Error::NotFound => LoadError::NotFound,
            _ => LoadError::Storage,
        })?;

        let mut bytes = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = file.read(&mut chunk).map_err(|_| LoadError::Storage)?;
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..n]);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatfs::FormatVolumeOptions;

    const VOLUME_SIZE: usize = 1024 * 1024;

    /// Format a volume in memory and put `files` in its root directory.
    fn volume(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut disk = vec![0u8; VOLUME_SIZE];
        {
            let mut dev = RamDisk::new(&mut disk);
            fatfs::format_volume(&mut dev, FormatVolumeOptions::new()).unwrap();
            dev.seek(SeekFrom::Start(0)).unwrap();

            let fs = FileSystem::new(dev, FsOptions::new()).unwrap();
            for (name, contents) in files {
                let mut file = fs.root_dir().create_file(name).unwrap();
                file.write_all(contents).unwrap();
                file.flush().unwrap();
            }
            fs.unmount().unwrap();
        }
        disk
    }

    #[test]
    fn reads_images_by_name() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut disk = volume(&[("echo.bin", &payload), ("mini-os.bin", b"\x00\x00\x00\x14")]);

        let mut store = FatImageStore::new(RamDisk::new(&mut disk)).unwrap();
        assert_eq!(store.read_image("echo.bin").unwrap(), payload);
        assert_eq!(store.read_image("mini-os.bin").unwrap(), b"\x00\x00\x00\x14");

        let mut names: Vec<_> = store.list().unwrap().into_iter().map(|(n, _)| n).collect();
        names.sort();
        assert_eq!(names, vec!["echo.bin", "mini-os.bin"]);
    }

    #[test]
    fn missing_image_is_not_found() {
        let mut disk = volume(&[("echo.bin", b"x")]);
        let mut store = FatImageStore::new(RamDisk::new(&mut disk)).unwrap();
        assert_eq!(store.read_image("nope.bin"), Err(LoadError::NotFound));
    }

    #[test]
    fn unformatted_disk_fails_to_mount() {
        let mut disk = vec![0u8; VOLUME_SIZE];
        assert!(matches!(
            FatImageStore::new(RamDisk::new(&mut disk)),
            Err(LoadError::Storage)
        ));
    }

    #[test]
    fn ram_disk_clamps_at_the_end() {
        let mut data = [0u8; 8];
        let mut disk = RamDisk::new(&mut data);
        assert_eq!(disk.seek(SeekFrom::End(-3)), Ok(5));
        assert_eq!(disk.write(&[1, 2, 3, 4, 5]), Ok(3));
        assert_eq!(disk.write(&[9]), Ok(0));
        assert_eq!(disk.seek(SeekFrom::Current(-9)), Err(()));

        disk.seek(SeekFrom::Start(4)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(disk.read(&mut buf), Ok(4));
        assert_eq!(&buf[..4], &[0, 1, 2, 3]);
    }
}
