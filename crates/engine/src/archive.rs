// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Directory payloads travel as a single uncompressed tar stream.
//!
//! All functions block; run them on `spawn_blocking`.

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use tar::{Archive, Builder, HeaderMode};
use tracing::debug;
use walkdir::WalkDir;

/// Name of the payload sent for directory `dir`: `<dirname>.tar`.
#[must_use]
pub fn archive_name(dir: &Path) -> String {
    let base = dir
        .file_name()
        .map_or_else(|| "folder".to_string(), |n| n.to_string_lossy().into_owned());
    format!("{base}.tar")
}

/// Packs `source` into an uncompressed tar at `dest`, with every entry
/// nested under the directory's own name.
///
/// Entries are visited in sorted order and written with deterministic
/// headers, so packing the same tree twice yields identical bytes and the
/// same digest. Symlinks are skipped.
pub fn create_archive(source: &Path, dest: &Path) -> io::Result<u64> {
    let root = source
        .file_name()
        .map_or_else(|| PathBuf::from("folder"), PathBuf::from);

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut builder = Builder::new(File::create(dest)?);
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    let mut files = 0usize;
    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let name = root.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder.append_dir(&name, entry.path())?;
        } else if file_type.is_file() {
            builder.append_path_with_name(entry.path(), &name)?;
            files += 1;
        }
    }

    let file = builder.into_inner()?;
    file.sync_all()?;
    let size = file.metadata()?.len();
    debug!(source = %source.display(), files, size, "archive created");
    Ok(size)
}

/// Unpacks `archive` into `dest_dir`, going through `staging` so that a
/// failed extraction never leaves half a tree at the final location.
///
/// Each top-level entry is moved into `dest_dir` under a name that does not
/// collide with existing content. Returns the final path of the (first)
/// top-level entry, or `dest_dir` for an empty archive.
pub fn extract_archive(archive: &Path, dest_dir: &Path, staging: &Path) -> io::Result<PathBuf> {
    if staging.exists() {
        fs::remove_dir_all(staging)?;
    }
    fs::create_dir_all(staging)?;

    let result = unpack_into(archive, dest_dir, staging);
    let _ = fs::remove_dir_all(staging);
    result
}

fn unpack_into(archive: &Path, dest_dir: &Path, staging: &Path) -> io::Result<PathBuf> {
    let mut tar = Archive::new(File::open(archive)?);
    tar.set_preserve_permissions(false);
    tar.set_overwrite(false);
    tar.unpack(staging)?;

    let mut top_level: Vec<_> = fs::read_dir(staging)?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<io::Result<_>>()?;
    top_level.sort();

    let mut first = None;
    for name in top_level {
        let target = unique_destination(dest_dir, &name.to_string_lossy());
        fs::rename(staging.join(&name), &target)?;
        first.get_or_insert(target);
    }
    Ok(first.unwrap_or_else(|| dest_dir.to_path_buf()))
}

/// `dir/name` if free, otherwise `dir/stem_1.ext`, `dir/stem_2.ext`, ...
#[must_use]
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map_or_else(|| name.to_string(), |s| s.to_string_lossy().into_owned());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{stem}_{n}.{ext}")),
            None => dir.join(format!("{stem}_{n}")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(root: &Path) -> PathBuf {
        let dir = root.join("photos");
        fs::create_dir_all(dir.join("2024")).unwrap();
        fs::write(dir.join("a.txt"), b"alpha").unwrap();
        fs::write(dir.join("2024").join("b.txt"), b"bravo").unwrap();
        dir
    }

    #[test]
    fn dedupes_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_destination(dir.path(), "report.pdf"), dir.path().join("report.pdf"));

        fs::write(dir.path().join("report.pdf"), b"x").unwrap();
        assert_eq!(unique_destination(dir.path(), "report.pdf"), dir.path().join("report_1.pdf"));
        fs::write(dir.path().join("report_1.pdf"), b"x").unwrap();
        assert_eq!(unique_destination(dir.path(), "report.pdf"), dir.path().join("report_2.pdf"));

        fs::create_dir(dir.path().join("photos")).unwrap();
        assert_eq!(unique_destination(dir.path(), "photos"), dir.path().join("photos_1"));
    }

    #[test]
    fn archive_round_trip_with_collision() {
        let src = tempfile::tempdir().unwrap();
        let tree = sample_tree(src.path());
        let work = tempfile::tempdir().unwrap();
        let tar_path = work.path().join(archive_name(&tree));
        assert!(tar_path.ends_with("photos.tar"));

        create_archive(&tree, &tar_path).unwrap();

        let dest = tempfile::tempdir().unwrap();
        fs::create_dir(dest.path().join("photos")).unwrap();
        let staging = dest.path().join(".t1.extract");
        let out = extract_archive(&tar_path, dest.path(), &staging).unwrap();

        assert_eq!(out, dest.path().join("photos_1"));
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(out.join("2024").join("b.txt")).unwrap(), b"bravo");
        assert!(!staging.exists());
    }

    #[test]
    fn packing_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        let tree = sample_tree(src.path());
        let work = tempfile::tempdir().unwrap();
        let first = work.path().join("one.tar");
        let second = work.path().join("two.tar");
        create_archive(&tree, &first).unwrap();
        create_archive(&tree, &second).unwrap();
        assert_eq!(fs::read(first).unwrap(), fs::read(second).unwrap());
    }

    #[test]
    fn garbage_archive_leaves_nothing_behind() {
        let work = tempfile::tempdir().unwrap();
        let bogus = work.path().join("bogus.tar");
        fs::write(&bogus, vec![0x5a; 1500]).unwrap();
        let dest = work.path().join("dest");
        fs::create_dir(&dest).unwrap();
        let staging = dest.join(".x.extract");

        assert!(extract_archive(&bogus, &dest, &staging).is_err());
        assert!(!staging.exists());
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }
}
