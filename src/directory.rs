//! Per-container directory tree and the virtual path space over it
//!
//! A container root holds three subtrees:
//!
//! - `bin`: host binaries, read-only for the container user
//! - `user`: the container user's working directory, read-write
//! - `private`: service bookkeeping, invisible to the container user
//!
//! Paths handed in by callers are virtual and rooted (`/app/start.cmd`).
//! They are resolved lexically so mapping is deterministic and a path can
//! never climb out of its subtree.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::filesystem::{FileAccess, FileSystem, UserAccess};
use crate::{platform, Error, Result};

pub const BIN_DIRECTORY: &str = "bin";
pub const USER_DIRECTORY: &str = "user";
pub const PRIVATE_DIRECTORY: &str = "private";

const MAX_SYMLINK_DEPTH: usize = 32;

/// A host directory exposed inside the container's user subtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindMount {
    pub source_path: String,
    pub destination_path: String,
    #[serde(default)]
    pub access: FileAccess,
}

pub struct ContainerDirectory {
    root: String,
    separator: char,
    file_system: Arc<dyn FileSystem>,
}

impl std::fmt::Debug for ContainerDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerDirectory")
            .field("root", &self.root)
            .finish()
    }
}

impl ContainerDirectory {
    /// Describe `{base_path}/{id}` without touching the filesystem
    pub fn new(file_system: Arc<dyn FileSystem>, base_path: &str, id: &str) -> Self {
        let separator = separator_of(base_path);
        let root = canonicalize(&format!("{base_path}{separator}{id}"), separator);
        Self {
            root,
            separator,
            file_system,
        }
    }

    /// Rebuild the value for an existing container root
    pub fn restore(file_system: Arc<dyn FileSystem>, root_path: &str) -> Self {
        let separator = separator_of(root_path);
        Self {
            root: canonicalize(root_path, separator),
            separator,
            file_system,
        }
    }

    pub fn root_path(&self) -> &str {
        &self.root
    }

    pub fn bin_path(&self) -> String {
        self.subtree(BIN_DIRECTORY)
    }

    pub fn user_path(&self) -> String {
        self.subtree(USER_DIRECTORY)
    }

    pub fn private_path(&self) -> String {
        self.subtree(PRIVATE_DIRECTORY)
    }

    /// Root of the volume the container lives on (`C:\` or `/`)
    pub fn volume(&self) -> String {
        if has_drive_letter(&self.root) {
            format!("{}{}", &self.root[..2], self.separator)
        } else {
            self.separator.to_string()
        }
    }

    fn subtree(&self, name: &str) -> String {
        format!("{}{}{}", self.root, self.separator, name)
    }

    pub fn map_bin_path(&self, path: &str) -> Result<String> {
        self.map_path(&self.bin_path(), path)
    }

    pub fn map_private_path(&self, path: &str) -> Result<String> {
        self.map_path(&self.private_path(), path)
    }

    pub fn map_user_path(&self, path: &str) -> Result<String> {
        self.map_path(&self.user_path(), path)
    }

    fn map_path(&self, base: &str, path: &str) -> Result<String> {
        let sep = self.separator;
        if has_drive_letter(path) {
            return Ok(path.to_string());
        }
        if path.trim().is_empty() {
            return Ok(format!("{base}{sep}"));
        }

        let relative = path.trim_start_matches(['/', '\\']);
        let mapped = canonicalize(&format!("{base}{sep}{relative}"), sep);

        let base_lower = base.to_lowercase();
        let mapped_lower = mapped.to_lowercase();
        if mapped_lower == base_lower || mapped_lower.starts_with(&format!("{base_lower}{sep}")) {
            Ok(mapped)
        } else {
            Err(Error::InvalidArgument(format!(
                "path '{path}' resolves outside of '{base}'"
            )))
        }
    }

    fn default_access() -> Vec<UserAccess> {
        vec![
            UserAccess::new(platform::administrators_principal(), FileAccess::ReadWrite),
            UserAccess::new(platform::current_user_name(), FileAccess::ReadWrite),
        ]
    }

    fn access_with(user_name: &str, access: FileAccess) -> Vec<UserAccess> {
        let mut list = Self::default_access();
        list.push(UserAccess::new(user_name, access));
        list
    }

    /// Create the root and its three subtrees with their ACLs
    pub fn create_subdirectories(&self, user_name: &str) -> Result<()> {
        let fs = &self.file_system;
        fs.create_directory(&self.root, &Self::access_with(user_name, FileAccess::Read))?;
        fs.create_directory(&self.private_path(), &Self::default_access())?;
        fs.create_directory(&self.bin_path(), &Self::access_with(user_name, FileAccess::Read))?;
        fs.create_directory(
            &self.user_path(),
            &Self::access_with(user_name, FileAccess::ReadWrite),
        )?;
        tracing::debug!(root = %self.root, user = user_name, "created container directories");
        Ok(())
    }

    pub fn create_bind_mounts(&self, mounts: &[BindMount], user_name: &str) -> Result<()> {
        let user_root = self.user_path().to_lowercase();
        for mount in mounts {
            let destination = self.map_user_path(&mount.destination_path)?;
            let source = canonicalize(&mount.source_path, separator_of(&mount.source_path));

            if let Some(parent) = parent_of(&destination, self.separator) {
                if parent.to_lowercase() != user_root && !self.file_system.directory_exists(parent) {
                    self.file_system.create_directory(
                        parent,
                        &Self::access_with(user_name, FileAccess::ReadWrite),
                    )?;
                }
            }

            self.file_system.create_symlink(&destination, &source)?;
            self.file_system
                .add_access(&destination, &UserAccess::new(user_name, FileAccess::Read))?;
            for target in self.symlink_chain(&source)? {
                self.file_system
                    .add_access(&target, &UserAccess::new(user_name, mount.access))?;
            }
            tracing::debug!(source = %source, destination = %destination, "bind mount created");
        }
        Ok(())
    }

    pub fn delete_bind_mounts(&self, mounts: &[BindMount], user_name: &str) -> Result<()> {
        for mount in mounts {
            let destination = self.map_user_path(&mount.destination_path)?;
            let source = canonicalize(&mount.source_path, separator_of(&mount.source_path));
            self.file_system.remove_access(&destination, user_name)?;
            for target in self.symlink_chain(&source)? {
                self.file_system.remove_access(&target, user_name)?;
            }
        }
        Ok(())
    }

    /// `start` followed by every target reached by following symlinks
    fn symlink_chain(&self, start: &str) -> Result<Vec<String>> {
        let mut chain = vec![start.to_string()];
        let mut current = start.to_string();
        while let Some(target) = self.file_system.read_symlink(&current)? {
            if chain.len() > MAX_SYMLINK_DEPTH {
                return Err(Error::InvalidArgument(format!(
                    "too many levels of symbolic links at '{start}'"
                )));
            }
            let sep = separator_of(&current);
            let resolved = if is_rooted(&target) {
                canonicalize(&target, separator_of(&target))
            } else {
                let parent = parent_of(&current, sep).unwrap_or("");
                canonicalize(&format!("{parent}{sep}{target}"), sep)
            };
            chain.push(resolved.clone());
            current = resolved;
        }
        Ok(chain)
    }

    /// Delete the whole tree; a tree that is already gone counts as deleted
    pub fn destroy(&self) -> Result<()> {
        match self.file_system.delete_directory(&self.root) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

fn has_drive_letter(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn is_rooted(path: &str) -> bool {
    has_drive_letter(path) || path.starts_with(['/', '\\'])
}

/// `\` for anything that looks like a Windows path, `/` otherwise
pub(crate) fn separator_of(path: &str) -> char {
    if has_drive_letter(path) || path.contains('\\') {
        '\\'
    } else {
        '/'
    }
}

/// Resolve `.` and `..` lexically and collapse separators, keeping the root.
/// `..` never climbs above the root.
pub(crate) fn canonicalize(path: &str, separator: char) -> String {
    let (prefix, rest) = if has_drive_letter(path) {
        let rest = &path[2..];
        if rest.starts_with(['/', '\\']) {
            (format!("{}{separator}", &path[..2]), rest)
        } else {
            (path[..2].to_string(), rest)
        }
    } else if path.starts_with(['/', '\\']) {
        (separator.to_string(), path)
    } else {
        (String::new(), path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in rest.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("{prefix}{}", parts.join(&separator.to_string()))
}

fn parent_of(path: &str, separator: char) -> Option<&str> {
    let trimmed = path.trim_end_matches(separator);
    trimmed.rfind(separator).map(|idx| &trimmed[..idx])
}
