//! Tar archives exchanged with the engine
//!
//! Files are copied into containers and build contexts are streamed to the
//! engine as uncompressed tar archives, the format both the `cp -`/`build -`
//! CLI commands and the Engine API accept.

use std::io::{self, Read};
use std::path::Path;

/// Archive holding a single regular file
pub fn single_file(name: &str, contents: &[u8], mode: u32) -> io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, contents)?;
    builder.into_inner()
}

/// Contents of the first regular file in an archive
pub fn first_file(archive: &[u8]) -> io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "archive contains no regular file",
    ))
}

/// Append `line` to text file contents, adding a separating newline if missing
pub fn append_line(mut contents: Vec<u8>, line: &str) -> Vec<u8> {
    if !contents.is_empty() && !contents.ends_with(b"\n") {
        contents.push(b'\n');
    }
    contents.extend_from_slice(line.as_bytes());
    if !line.ends_with('\n') {
        contents.push(b'\n');
    }
    contents
}

/// Package a build context directory, storing `dockerfile` as `Dockerfile`
///
/// A file already named `Dockerfile` at the context root is replaced by the
/// chosen one.
pub fn pack_build_context(context: &Path, dockerfile: &Path) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    append_tree(&mut builder, context, context, dockerfile)?;
    builder.append_path_with_name(dockerfile, "Dockerfile")?;
    builder.into_inner()
}

fn append_tree(
    builder: &mut tar::Builder<Vec<u8>>,
    root: &Path,
    dir: &Path,
    dockerfile: &Path,
) -> io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        if path == dockerfile || relative == Path::new("Dockerfile") {
            continue;
        }
        if entry.file_type()?.is_dir() {
            builder.append_dir(relative, &path)?;
            append_tree(builder, root, &path, dockerfile)?;
        } else {
            builder.append_path_with_name(&path, relative)?;
        }
    }
    Ok(())
}
