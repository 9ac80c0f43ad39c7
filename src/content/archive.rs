//! Archive expansion and base-image decompression
//!
//! Expansion refuses members that would land outside the destination
//! (absolute paths, `..` traversal) instead of silently skipping them.

use crate::error::{ImagerError, ImagerResult};
use crate::recipe::Via;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

const COPY_BUFFER: usize = 16 * 1024 * 1024;

/// Expand an archive into `dest_dir` and return the expanded size
pub fn expand(src: &Path, via: Via, dest_dir: &Path) -> ImagerResult<u64> {
    std::fs::create_dir_all(dest_dir)
        .map_err(|e| ImagerError::io(format!("creating {}", dest_dir.display()), e))?;
    debug!(src = %src.display(), ?via, "expanding archive");

    let file = File::open(src).map_err(|e| ImagerError::io(format!("opening {}", src.display()), e))?;
    match via {
        Via::Direct => {
            return Err(ImagerError::RecipeInvalid(
                "direct files are not archives".to_string(),
            ))
        }
        Via::Tar => unpack_tar(tar::Archive::new(BufReader::new(file)), dest_dir)?,
        Via::Gztar => unpack_tar(
            tar::Archive::new(GzDecoder::new(BufReader::new(file))),
            dest_dir,
        )?,
        Via::Bztar => unpack_tar(
            tar::Archive::new(bzip2::read::BzDecoder::new(BufReader::new(file))),
            dest_dir,
        )?,
        Via::Xztar => unpack_tar(
            tar::Archive::new(xz2::read::XzDecoder::new(BufReader::new(file))),
            dest_dir,
        )?,
        Via::Zip => unpack_zip(file, dest_dir)?,
    }
    dir_size(dest_dir)
}

fn unpack_tar<R: Read>(mut archive: tar::Archive<R>, dest_dir: &Path) -> ImagerResult<()> {
    let entries = archive
        .entries()
        .map_err(|e| ImagerError::io("reading archive", e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ImagerError::io("reading archive member", e))?;
        let path = entry
            .path()
            .map_err(|e| ImagerError::io("reading archive member path", e))?
            .into_owned();
        let target = safe_member_path(dest_dir, &path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ImagerError::io("creating member directory", e))?;
        }
        entry
            .unpack(&target)
            .map_err(|e| ImagerError::io(format!("unpacking {}", path.display()), e))?;
    }
    Ok(())
}

fn unpack_zip(file: File, dest_dir: &Path) -> ImagerResult<()> {
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| ImagerError::io("reading zip", std::io::Error::other(e)))?;
    for index in 0..archive.len() {
        let mut member = archive
            .by_index(index)
            .map_err(|e| ImagerError::io("reading zip member", std::io::Error::other(e)))?;
        let raw_name = member.name().to_string();
        let Some(relative) = member.enclosed_name() else {
            return Err(ImagerError::RecipeInvalid(format!(
                "zip contains out-of-bound member path: {raw_name}"
            )));
        };
        let target = dest_dir.join(relative);
        if member.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| ImagerError::io("creating member directory", e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ImagerError::io("creating member directory", e))?;
        }
        let mut out = File::create(&target)
            .map_err(|e| ImagerError::io(format!("creating {}", target.display()), e))?;
        std::io::copy(&mut member, &mut out)
            .map_err(|e| ImagerError::io(format!("unpacking {raw_name}"), e))?;
    }
    Ok(())
}

/// Join a member path onto the destination, refusing absolute paths and
/// traversal
fn safe_member_path(dest_dir: &Path, member: &Path) -> ImagerResult<PathBuf> {
    if member.is_absolute() {
        return Err(ImagerError::RecipeInvalid(format!(
            "archive contains member with absolute path: {}",
            member.display()
        )));
    }
    for component in member.components() {
        if matches!(component, Component::ParentDir) {
            return Err(ImagerError::RecipeInvalid(format!(
                "archive contains out-of-bound member path: {}",
                member.display()
            )));
        }
    }
    Ok(dest_dir.join(member))
}

/// Total size in bytes of a file or directory tree
pub fn dir_size(path: &Path) -> ImagerResult<u64> {
    let metadata = std::fs::symlink_metadata(path)
        .map_err(|e| ImagerError::io(format!("sizing {}", path.display()), e))?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    if !metadata.is_dir() {
        return Ok(0);
    }
    let mut total = 0;
    let listing = std::fs::read_dir(path)
        .map_err(|e| ImagerError::io(format!("listing {}", path.display()), e))?;
    for item in listing {
        let item = item.map_err(|e| ImagerError::io("listing directory", e))?;
        total += dir_size(&item.path())?;
    }
    Ok(total)
}

/// Decompress an xz-compressed base image into `dest`, returning the
/// decompressed size
pub fn decompress_xz_image(src: &Path, dest: &Path) -> ImagerResult<u64> {
    let file = File::open(src).map_err(|e| ImagerError::io(format!("opening {}", src.display()), e))?;
    let mut reader = xz2::read::XzDecoder::new(BufReader::new(file));
    let out = File::create(dest)
        .map_err(|e| ImagerError::io(format!("creating {}", dest.display()), e))?;
    let mut writer = BufWriter::new(out);

    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut written: u64 = 0;
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| ImagerError::io(format!("decompressing {}", src.display()), e))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .map_err(|e| ImagerError::io(format!("writing {}", dest.display()), e))?;
        written += read as u64;
    }
    writer
        .flush()
        .map_err(|e| ImagerError::io(format!("flushing {}", dest.display()), e))?;
    Ok(written)
}
