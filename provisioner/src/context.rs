//! Build contexts: the files sent to the engine for an image build.
//!
//! A context is walked the way the engine itself would see it, honoring
//! `.dockerignore` but not `.gitignore`. The same walk feeds both the
//! content digest stored on built images and the tar archive handed to
//! the engine.

use anyhow::Result;
use ignore::WalkBuilder;
use number_prefix::NumberPrefix;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};
use tar::Builder as TarBuilder;
use tempfile::TempDir;

use crate::{
    error::{build_failure, ProvisionError},
    models::ImageSpec,
};

#[derive(Copy, Clone, PartialEq)]
enum Kind {
    Dir,
    Symlink,
    File,
}

struct Entry {
    path: PathBuf,
    relative: PathBuf,
    kind: Kind,
}

fn build_error(spec: &ImageSpec, reason: String) -> anyhow::Error {
    ProvisionError::Build {
        image: spec.name.0.clone(),
        reason,
    }
    .into()
}

fn walk(spec: &ImageSpec) -> Result<Vec<Entry>> {
    if !spec.context.is_dir() {
        return Err(build_error(
            spec,
            format!(
                "build context {} does not exist or is not a directory",
                spec.context.display()
            ),
        ));
    }

    if !spec.context.join(&spec.dockerfile).is_file() {
        return Err(build_error(
            spec,
            format!(
                "{} not found in build context {}",
                spec.dockerfile.display(),
                spec.context.display()
            ),
        ));
    }

    let walk = WalkBuilder::new(&spec.context)
        .add_custom_ignore_filename(".dockerignore")
        .ignore(false)
        .git_global(false)
        .git_ignore(false)
        .git_exclude(false)
        .parents(false)
        .hidden(false)
        .build();

    let mut entries = Vec::new();
    for result in walk {
        let result = result?;
        let relative = result.path().strip_prefix(&spec.context)?.to_path_buf();
        if relative.as_os_str().is_empty() {
            continue;
        }

        // Links are never followed, the engine stores them as links.
        let kind = match result.file_type() {
            Some(t) if t.is_symlink() => Kind::Symlink,
            Some(t) if t.is_dir() => Kind::Dir,
            _ => Kind::File,
        };
        entries.push(Entry {
            path: result.path().to_path_buf(),
            relative,
            kind,
        });
    }

    entries.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(entries)
}

/// Content digest of the build context. Changes whenever a file that would
/// be sent to the engine is added, removed, renamed or edited.
pub fn digest(spec: &ImageSpec) -> Result<String> {
    digest_entries(spec).map_err(|err| build_failure(&spec.name.0, err))
}

fn digest_entries(spec: &ImageSpec) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(spec.dockerfile.to_string_lossy().as_bytes());

    for entry in walk(spec)? {
        hasher.update(&[0]);
        hasher.update(entry.relative.to_string_lossy().as_bytes());
        match entry.kind {
            Kind::Dir => {
                hasher.update(b"/");
            }
            Kind::Symlink => {
                let target = fs::read_link(&entry.path)?;
                hasher.update(b"@");
                hasher.update(target.to_string_lossy().as_bytes());
            }
            Kind::File => {
                hasher.update(&[0]);
                let mut file = File::open(&entry.path)?;
                io::copy(&mut file, &mut hasher)?;
            }
        }
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// A tar archive of a build context, deleted when dropped.
#[derive(Debug)]
pub struct ContextArchive {
    dir: TempDir,
    path: PathBuf,
    pub size: u64,
}

impl ContextArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }
}

pub fn archive(spec: &ImageSpec) -> Result<ContextArchive> {
    write_archive(spec).map_err(|err| build_failure(&spec.name.0, err))
}

fn write_archive(spec: &ImageSpec) -> Result<ContextArchive> {
    let entries = walk(spec)?;

    let dir = TempDir::new()?;
    let path = dir.path().join("context.tar");
    let file = {
        let mut options = OpenOptions::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.write(true).create(true).open(&path)?
    };

    let mut tar = TarBuilder::new(file);
    tar.follow_symlinks(false);
    let mut size = 0;
    for entry in entries.iter() {
        tar.append_path_with_name(&entry.path, &entry.relative)?;
        if entry.kind == Kind::File {
            size += entry.path.metadata()?.len();
        }
    }
    tar.finish()?;

    match NumberPrefix::binary(size as f32) {
        NumberPrefix::Standalone(bytes) => println!("Archived build context ({} bytes)", bytes),
        NumberPrefix::Prefixed(prefix, n) => {
            println!("Archived build context ({:.1} {}B)", n, prefix)
        }
    };

    Ok(ContextArchive { dir, path, size })
}
