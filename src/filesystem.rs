//! Filesystem and ACL operations behind a mockable seam

use std::path::Path;

use serde::{Deserialize, Serialize};

#[cfg(windows)]
use crate::platform;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FileAccess {
    #[default]
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccess {
    pub user_name: String,
    pub access: FileAccess,
}

impl UserAccess {
    pub fn new(user_name: impl Into<String>, access: FileAccess) -> Self {
        Self {
            user_name: user_name.into(),
            access,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait FileSystem: Send + Sync {
    /// Create the directory (and parents) and replace its ACL with `access`
    fn create_directory(&self, path: &str, access: &[UserAccess]) -> Result<()>;

    /// Remove a directory tree; a missing directory is a not-found error
    fn delete_directory(&self, path: &str) -> Result<()>;

    fn directory_exists(&self, path: &str) -> bool;

    /// Full paths of the immediate subdirectories
    fn enumerate_directories(&self, path: &str) -> Result<Vec<String>>;

    fn copy_file(&self, source: &str, destination: &str) -> Result<()>;

    /// Directory symlink at `link` pointing at `target`
    fn create_symlink(&self, link: &str, target: &str) -> Result<()>;

    /// Target of `path` if it is a symlink
    fn read_symlink(&self, path: &str) -> Result<Option<String>>;

    fn add_access(&self, path: &str, access: &UserAccess) -> Result<()>;

    fn remove_access(&self, path: &str, user_name: &str) -> Result<()>;
}

/// `std::fs` plus `icacls` for ACLs on Windows
#[derive(Debug, Default, Clone)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(windows)]
fn icacls_grant(path: &str, access: &UserAccess, replace: bool) -> Result<()> {
    let rights = match access.access {
        FileAccess::Read => "RX",
        FileAccess::ReadWrite => "M",
    };
    let grant = format!("{}:(OI)(CI){}", access.user_name, rights);
    let flag = if replace { "/grant:r" } else { "/grant" };
    platform::run_command("icacls", &[path, flag, &grant, "/C", "/Q"])?;
    Ok(())
}

impl FileSystem for LocalFileSystem {
    fn create_directory(&self, path: &str, access: &[UserAccess]) -> Result<()> {
        std::fs::create_dir_all(path)?;

        #[cfg(windows)]
        {
            platform::run_command("icacls", &[path, "/inheritance:r", "/C", "/Q"])?;
            for entry in access {
                icacls_grant(path, entry, true)?;
            }
        }
        #[cfg(not(windows))]
        tracing::debug!(path, entries = access.len(), "directory ACLs are not applied on this platform");

        Ok(())
    }

    fn delete_directory(&self, path: &str) -> Result<()> {
        // remove_dir_all removes symlinks without following them
        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    fn directory_exists(&self, path: &str) -> bool {
        Path::new(path).is_dir()
    }

    fn enumerate_directories(&self, path: &str) -> Result<Vec<String>> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path().to_string_lossy().into_owned());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn copy_file(&self, source: &str, destination: &str) -> Result<()> {
        std::fs::copy(source, destination).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("copying {source} to {destination}: {e}"),
            ))
        })?;
        Ok(())
    }

    fn create_symlink(&self, link: &str, target: &str) -> Result<()> {
        #[cfg(windows)]
        std::os::windows::fs::symlink_dir(target, link)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, link)?;
        Ok(())
    }

    fn read_symlink(&self, path: &str) -> Result<Option<String>> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => Ok(Some(
                std::fs::read_link(path)?.to_string_lossy().into_owned(),
            )),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn add_access(&self, path: &str, access: &UserAccess) -> Result<()> {
        #[cfg(windows)]
        icacls_grant(path, access, false)?;
        #[cfg(not(windows))]
        tracing::debug!(path, user = %access.user_name, "ACL grant skipped on this platform");
        Ok(())
    }

    fn remove_access(&self, path: &str, user_name: &str) -> Result<()> {
        #[cfg(windows)]
        platform::run_command("icacls", &[path, "/remove", user_name, "/C", "/Q"])?;
        #[cfg(not(windows))]
        tracing::debug!(path, user = user_name, "ACL removal skipped on this platform");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn path_str(p: &Path) -> String {
        p.to_string_lossy().into_owned()
    }

    #[test]
    fn create_enumerate_delete() {
        let temp = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let root = temp.path().join("root");
        let access = [UserAccess::new("someone", FileAccess::Read)];

        fs.create_directory(&path_str(&root.join("a")), &access).unwrap();
        fs.create_directory(&path_str(&root.join("b")), &access).unwrap();
        std::fs::write(root.join("file.txt"), b"x").unwrap();

        let dirs = fs.enumerate_directories(&path_str(&root)).unwrap();
        assert_eq!(dirs, vec![path_str(&root.join("a")), path_str(&root.join("b"))]);

        fs.delete_directory(&path_str(&root)).unwrap();
        assert!(!fs.directory_exists(&path_str(&root)));
        assert!(fs.delete_directory(&path_str(&root)).unwrap_err().is_not_found());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_reported_and_not_followed_on_delete() {
        let temp = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let source = temp.path().join("source");
        let container = temp.path().join("container");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("keep.txt"), b"x").unwrap();
        std::fs::create_dir_all(&container).unwrap();

        let link = container.join("mount");
        fs.create_symlink(&path_str(&link), &path_str(&source)).unwrap();
        assert_eq!(
            fs.read_symlink(&path_str(&link)).unwrap(),
            Some(path_str(&source))
        );
        assert_eq!(fs.read_symlink(&path_str(&source)).unwrap(), None);

        fs.delete_directory(&path_str(&container)).unwrap();
        assert!(source.join("keep.txt").exists());
    }

    #[test]
    fn copy_file_reports_source() {
        let temp = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let missing = path_str(&temp.path().join("missing"));
        let err = fs
            .copy_file(&missing, &path_str(&temp.path().join("dest")))
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
