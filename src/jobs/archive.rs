//! Working-directory archives.
//!
//! A finished job's working directory can be packed into a single
//! zstd-compressed file inside the directory itself. The stream starts with
//! [`MAGIC`] followed by one entry per file: a little-endian `u32` path
//! length, the `/`-separated relative path, a little-endian `u64` data length
//! and the file contents.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::core::errors::{JobError, Result};

/// File name of the archive inside the working directory
pub const ARCHIVE_FILE: &str = "working_directory.zst";

const MAGIC: &[u8; 4] = b"JRA1";

/// Pack every regular file below `dir` into `dir/ARCHIVE_FILE` and remove
/// the packed files. Returns the number of files packed; zero when there is
/// nothing to pack or the directory is already packed.
pub fn pack(dir: &Path, level: i32) -> Result<usize> {
    let archive = dir.join(ARCHIVE_FILE);
    if !dir.is_dir() || archive.exists() {
        return Ok(0);
    }

    let partial_name = format!("{}.partial", ARCHIVE_FILE);
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.retain(|relative| relative != Path::new(&partial_name));
    if files.is_empty() {
        return Ok(0);
    }
    files.sort();

    let partial = dir.join(&partial_name);
    {
        let mut encoder = zstd::stream::write::Encoder::new(BufWriter::new(File::create(&partial)?), level)?;
        encoder.write_all(MAGIC)?;
        for relative in &files {
            let name = entry_name(relative)?;
            let data = fs::read(dir.join(relative))?;
            encoder.write_all(&(name.len() as u32).to_le_bytes())?;
            encoder.write_all(name.as_bytes())?;
            encoder.write_all(&(data.len() as u64).to_le_bytes())?;
            encoder.write_all(&data)?;
        }
        encoder.finish()?.flush()?;
    }
    fs::rename(&partial, &archive)?;

    for relative in &files {
        fs::remove_file(dir.join(relative))?;
    }
    remove_empty_directories(dir)?;
    debug!(dir = %dir.display(), files = files.len(), "Packed working directory");
    Ok(files.len())
}

/// Restore the files of `dir/ARCHIVE_FILE` and delete the archive. Returns
/// the number of files restored; zero when there is no archive.
pub fn unpack(dir: &Path) -> Result<usize> {
    let archive = dir.join(ARCHIVE_FILE);
    if !archive.is_file() {
        return Ok(0);
    }

    let mut decoder = zstd::stream::read::Decoder::new(File::open(&archive)?)?;
    let mut magic = [0u8; 4];
    decoder.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(JobError::internal(format!(
            "{} is not a working-directory archive",
            archive.display()
        )));
    }

    let mut restored = 0;
    while let Some(name_len) = read_u32(&mut decoder)? {
        let mut name = vec![0u8; name_len as usize];
        decoder.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| JobError::internal("archive entry name is not UTF-8"))?;
        let relative = checked_relative(&name)?;

        let mut len = [0u8; 8];
        decoder.read_exact(&mut len)?;
        let mut data = Vec::new();
        (&mut decoder).take(u64::from_le_bytes(len)).read_to_end(&mut data)?;

        let target = dir.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, data)?;
        restored += 1;
    }

    fs::remove_file(&archive)?;
    debug!(dir = %dir.display(), files = restored, "Unpacked working directory");
    Ok(restored)
}

pub fn is_packed(dir: &Path) -> bool {
    dir.join(ARCHIVE_FILE).is_file()
}

/// Copy the regular files below `from` into `to`, creating directories as
/// needed
pub fn copy_tree(from: &Path, to: &Path) -> Result<usize> {
    let mut files = Vec::new();
    collect_files(from, from, &mut files)?;
    for relative in &files {
        let target = to.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from.join(relative), &target)?;
    }
    Ok(files.len())
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &entry.path(), files)?;
        } else if file_type.is_file() {
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .map_err(|e| JobError::internal(e.to_string()))?;
            files.push(relative.to_path_buf());
        }
    }
    Ok(())
}

fn remove_empty_directories(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let path = entry.path();
            remove_empty_directories(&path)?;
            if fs::read_dir(&path)?.next().is_none() {
                fs::remove_dir(&path)?;
            }
        }
    }
    Ok(())
}

fn entry_name(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                JobError::internal(format!("{} is not valid UTF-8", relative.display()))
            })?),
            _ => return Err(JobError::internal(format!("unexpected path {}", relative.display()))),
        }
    }
    Ok(parts.join("/"))
}

/// Entries must stay inside the working directory
fn checked_relative(name: &str) -> Result<PathBuf> {
    let relative = PathBuf::from(name);
    let inside = !name.is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !inside {
        return Err(JobError::internal(format!("archive entry '{}' escapes the working directory", name)));
    }
    Ok(relative)
}

/// `None` at a clean end of the stream
fn read_u32(reader: &mut impl Read) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 if filled == 0 => return Ok(None),
            0 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated archive entry")),
            n => filled += n,
        }
    }
    Ok(Some(u32::from_le_bytes(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pack_and_unpack_restore_nested_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "structure\n").unwrap();
        fs::create_dir_all(dir.path().join("out/steps")).unwrap();
        fs::write(dir.path().join("out/steps/1.json"), "{\"e\": 1}").unwrap();
        fs::write(dir.path().join("empty"), "").unwrap();

        assert_eq!(pack(dir.path(), 3).unwrap(), 3);
        assert!(is_packed(dir.path()));
        assert!(!dir.path().join("in.txt").exists());
        assert!(!dir.path().join("out").exists());
        // Packing twice is a no-op
        assert_eq!(pack(dir.path(), 3).unwrap(), 0);

        assert_eq!(unpack(dir.path()).unwrap(), 3);
        assert!(!is_packed(dir.path()));
        assert_eq!(fs::read_to_string(dir.path().join("in.txt")).unwrap(), "structure\n");
        assert_eq!(fs::read_to_string(dir.path().join("out/steps/1.json")).unwrap(), "{\"e\": 1}");
        assert_eq!(fs::read(dir.path().join("empty")).unwrap(), Vec::<u8>::new());
        assert_eq!(unpack(dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_missing_or_empty_directory_packs_nothing() {
        let dir = TempDir::new().unwrap();
        assert_eq!(pack(&dir.path().join("missing"), 3).unwrap(), 0);
        assert_eq!(pack(dir.path(), 3).unwrap(), 0);
        assert!(!is_packed(dir.path()));
    }

    #[test]
    fn test_entries_outside_the_directory_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut encoder =
            zstd::stream::write::Encoder::new(File::create(dir.path().join(ARCHIVE_FILE)).unwrap(), 3).unwrap();
        encoder.write_all(MAGIC).unwrap();
        let name = b"../escaped";
        encoder.write_all(&(name.len() as u32).to_le_bytes()).unwrap();
        encoder.write_all(name).unwrap();
        encoder.write_all(&1u64.to_le_bytes()).unwrap();
        encoder.write_all(b"x").unwrap();
        encoder.finish().unwrap();

        assert!(matches!(unpack(dir.path()), Err(JobError::Internal(_))));
        assert!(!dir.path().parent().unwrap().join("escaped").exists());
    }

    #[test]
    fn test_copy_tree_keeps_the_layout() {
        let from = TempDir::new().unwrap();
        let to = TempDir::new().unwrap();
        fs::create_dir_all(from.path().join("a/b")).unwrap();
        fs::write(from.path().join("a/b/c.txt"), "c").unwrap();
        fs::write(from.path().join("top.txt"), "top").unwrap();

        let target = to.path().join("copy_files");
        assert_eq!(copy_tree(from.path(), &target).unwrap(), 2);
        assert_eq!(fs::read_to_string(target.join("a/b/c.txt")).unwrap(), "c");
        assert_eq!(fs::read_to_string(target.join("top.txt")).unwrap(), "top");
        assert!(from.path().join("top.txt").exists());
    }
}
