//! Filesystem helpers: atomic file replacement and sync primitives.

use std::fs::File;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

/// Atomically replace the contents of `path`: write a sibling tmp file,
/// optionally fsync it, then rename over the target.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8], fsync: bool) -> Result<(), Error> {
    let path = path.as_ref();
    let mut tmp_path = path.to_path_buf();
    tmp_path.set_extension("tmp");

    let mut file = File::create(&tmp_path)
        .map_err(|err| format_err!("unable to create {:?} - {}", tmp_path, err))?;
    file.write_all(data)?;

    if fsync {
        fsync_file(&file)?;
    }
    drop(file);

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("atomic rename {:?} -> {:?} failed - {}", tmp_path, path, err);
    }

    Ok(())
}

pub fn fsync_file(file: &File) -> Result<(), Error> {
    nix::unistd::fsync(file.as_raw_fd()).map_err(|err| format_err!("fsync failed - {}", err))
}

/// Cheaper sync for append-only files where metadata timestamps don't matter.
pub fn fdatasync_file(file: &File) -> Result<(), Error> {
    nix::unistd::fdatasync(file.as_raw_fd())
        .map_err(|err| format_err!("fdatasync failed - {}", err))
}

/// fsync a directory handle to persist renames/unlinks done inside it.
pub fn fsync_dir<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let dir = File::open(path.as_ref())
        .map_err(|err| format_err!("unable to open dir {:?} - {}", path.as_ref(), err))?;
    fsync_file(&dir)
}

/// List the plain files directly inside `dir` whose name starts with
/// `prefix`, sorted by name. Missing directory is an error; the storage
/// layout creates its directories up front.
pub fn list_files_with_prefix<P: AsRef<Path>>(
    dir: P,
    prefix: &str,
) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir.as_ref())
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry
            .map_err(|err| format_err!("unable to read dir {:?} - {}", dir.as_ref(), err))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with(prefix))
            .unwrap_or(false)
        {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Create `dir` and any missing parents.
pub fn create_path<P: AsRef<Path>>(dir: P) -> Result<(), Error> {
    std::fs::create_dir_all(dir.as_ref())
        .map_err(|err| format_err!("unable to create path {:?} - {}", dir.as_ref(), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_file() {
        let dir = std::env::temp_dir().join(".silo-test-replace-file");
        let _ = std::fs::remove_dir_all(&dir);
        create_path(&dir).unwrap();

        let path = dir.join("state");
        replace_file(&path, b"one", false).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"one");
        replace_file(&path, b"two", true).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_list_files_with_prefix() {
        let dir = std::env::temp_dir().join(".silo-test-list-files");
        let _ = std::fs::remove_dir_all(&dir);
        create_path(&dir).unwrap();

        std::fs::write(dir.join("log.00000000000000000001.3"), b"").unwrap();
        std::fs::write(dir.join("log.00000000000000000001.1"), b"").unwrap();
        std::fs::write(dir.join("other"), b"").unwrap();
        create_path(dir.join("log.subdir")).unwrap();

        let files = list_files_with_prefix(&dir, "log.").unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(
            names,
            vec!["log.00000000000000000001.1", "log.00000000000000000001.3"]
        );

        let _ = std::fs::remove_dir_all(&dir);
    }
}
