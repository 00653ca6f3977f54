use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, EntryType, Header};
use tokio_util::sync::CancellationToken;

use super::{PackagerError, Result, parent_dir};

/// Name of the bundle manifest at the root of every archive.
pub const BUNDLE_FILE: &str = "bundle.json";

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Packs `src_dir` into a gzip-compressed tarball at `dest`.
///
/// Entries are written in sorted path order with zeroed timestamps and
/// owners, so the same directory always produces the same bytes. The
/// tarball is built in a temporary file next to `dest` and renamed into
/// place at the end; on error or cancellation `dest` is left untouched.
pub async fn write_archive(
    src_dir: PathBuf,
    dest: PathBuf,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::task::spawn_blocking(move || write_blocking(&src_dir, &dest, &cancel)).await?
}

/// Unpacks the tarball at `archive` into `dest_dir`. Only regular files and
/// directories are accepted, and no entry may land outside `dest_dir`.
pub async fn unpack_archive(
    archive: PathBuf,
    dest_dir: PathBuf,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::task::spawn_blocking(move || unpack_blocking(&archive, &dest_dir, &cancel)).await?
}

fn write_blocking(src_dir: &Path, dest: &Path, cancel: &CancellationToken) -> Result<()> {
    let mut entries = Vec::new();
    collect_entries(src_dir, Path::new(""), &mut entries)?;
    entries.sort();

    let mut partial = tempfile::Builder::new()
        .prefix(".stowage-")
        .suffix(".partial")
        .tempfile_in(parent_dir(dest))?;

    {
        let encoder = GzEncoder::new(BufWriter::new(partial.as_file_mut()), Compression::default());
        let mut builder = Builder::new(encoder);
        for relative in &entries {
            if cancel.is_cancelled() {
                return Err(PackagerError::Cancelled);
            }
            append_entry(&mut builder, &src_dir.join(relative), relative)?;
        }
        let mut writer = builder.into_inner()?.finish()?;
        writer.flush()?;
    }

    if cancel.is_cancelled() {
        return Err(PackagerError::Cancelled);
    }
    partial.persist(dest).map_err(|e| e.error)?;

    tracing::info!(archive = %dest.display(), entries = entries.len(), "wrote archive");
    Ok(())
}

fn collect_entries(root: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let path = relative.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            out.push(path.clone());
            collect_entries(root, &path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        } else {
            return Err(PackagerError::Archive(format!(
                "refusing to archive special file {}",
                path.display()
            )));
        }
    }
    Ok(())
}

fn append_entry<W: Write>(builder: &mut Builder<W>, source: &Path, relative: &Path) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    if source.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_mode(DIR_MODE);
        header.set_size(0);
        builder.append_data(&mut header, relative, std::io::empty())?;
    } else {
        let file = File::open(source)?;
        header.set_entry_type(EntryType::Regular);
        header.set_mode(FILE_MODE);
        header.set_size(file.metadata()?.len());
        builder.append_data(&mut header, relative, BufReader::new(file))?;
    }
    Ok(())
}

fn unpack_blocking(archive: &Path, dest_dir: &Path, cancel: &CancellationToken) -> Result<()> {
    let file = File::open(archive)?;
    let mut tarball = Archive::new(GzDecoder::new(BufReader::new(file)));

    let entries = tarball
        .entries()
        .map_err(|e| PackagerError::Archive(format!("{}: {e}", archive.display())))?;
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(PackagerError::Cancelled);
        }
        let mut entry =
            entry.map_err(|e| PackagerError::Archive(format!("{}: {e}", archive.display())))?;
        let path = entry.path()?.into_owned();

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory => {}
            other => {
                return Err(PackagerError::Archive(format!(
                    "unsupported entry {} of type {other:?}",
                    path.display()
                )));
            }
        }
        if !entry.unpack_in(dest_dir)? {
            return Err(PackagerError::Archive(format!(
                "entry {} escapes the archive root",
                path.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_names(archive: &Path) -> Vec<String> {
        let file = File::open(archive).unwrap();
        let mut tarball = Archive::new(GzDecoder::new(file));
        tarball
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    fn staged(dir: &Path) {
        std::fs::write(dir.join(BUNDLE_FILE), br#"{"name":"foo","version":"1.0.0"}"#).unwrap();
        let blobs = dir.join("artifacts/layout/blobs/sha256");
        std::fs::create_dir_all(&blobs).unwrap();
        std::fs::write(blobs.join("bb"), b"second").unwrap();
        std::fs::write(blobs.join("aa"), b"first").unwrap();
        std::fs::write(dir.join("artifacts/layout/index.json"), b"{}").unwrap();
    }

    #[tokio::test]
    async fn thin_archive_holds_only_the_manifest() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join(BUNDLE_FILE), b"{}").unwrap();
        let dest = out.path().join("foo-1.0.0.tgz");

        write_archive(src.path().to_path_buf(), dest.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(entry_names(&dest), vec![BUNDLE_FILE.to_string()]);
    }

    #[tokio::test]
    async fn entries_are_sorted_and_bytes_are_stable() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        staged(src.path());

        let first = out.path().join("first.tgz");
        let second = out.path().join("second.tgz");
        write_archive(src.path().to_path_buf(), first.clone(), CancellationToken::new())
            .await
            .unwrap();
        write_archive(src.path().to_path_buf(), second.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
        let names = entry_names(&first);
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"artifacts/layout/blobs/sha256/aa".to_string()));
    }

    #[tokio::test]
    async fn cancelled_write_leaves_no_archive() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        staged(src.path());
        let dest = out.path().join("foo.tgz");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = write_archive(src.path().to_path_buf(), dest.clone(), cancel).await;

        assert!(matches!(result, Err(PackagerError::Cancelled)));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unpack_restores_the_tree() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        staged(src.path());
        let archive = out.path().join("foo.tgz");
        write_archive(src.path().to_path_buf(), archive.clone(), CancellationToken::new())
            .await
            .unwrap();

        let dest = out.path().join("unpacked");
        std::fs::create_dir(&dest).unwrap();
        unpack_archive(archive, dest.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(dest.join("artifacts/layout/blobs/sha256/aa")).unwrap(),
            b"first"
        );
        assert!(dest.join(BUNDLE_FILE).is_file());
    }

    #[tokio::test]
    async fn unpack_rejects_symlinks() {
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("evil.tgz");
        {
            let file = File::create(&archive).unwrap();
            let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder
                .append_link(&mut header, "link", "/etc/passwd")
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = out.path().join("unpacked");
        std::fs::create_dir(&dest).unwrap();
        let result = unpack_archive(archive, dest.clone(), CancellationToken::new()).await;

        assert!(matches!(result, Err(PackagerError::Archive(_))));
        assert!(!dest.join("link").exists());
    }
}
