use std::{
    error::Error,
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fs_err::tokio::{self as fs, File};
use sysproxy::Sysproxy;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, instrument, warn};

#[instrument(ret, level = "debug")]
pub fn get_sys_proxy() -> Option<String> {
    match Sysproxy::get_system_proxy() {
        Ok(proxy) if proxy.enable => {
            let result = format!("http://{}:{}", proxy.host, proxy.port);
            debug!(proxy = &result, "got system proxy");
            Some(result)
        }
        Ok(_) => None,
        Err(e) => {
            error!(error = &e as &dyn Error, "failed to get system proxy");
            None
        }
    }
}

/// Resolves an executable given either as a path or as a name looked up in `PATH`.
#[instrument(level = "debug", err)]
pub fn resolve_binary_path(name_or_path: &str) -> Result<PathBuf> {
    which::which(name_or_path).with_context(|| format!("Binary {name_or_path} not found"))
}

/// Lowercase hex md5 of a file's contents.
pub async fn compute_md5_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut buf = vec![0u8; 1024 * 64];
    let mut ctx = md5::Context::new();
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.finalize()))
}

/// Removes every entry inside `dir`, keeping the directory itself. Missing dir is fine.
#[instrument(skip(dir), fields(dir = %dir.display()), err)]
pub async fn clear_dir(dir: &Path) -> Result<()> {
    let mut rd = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context("Failed to list directory"),
    };
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        if let Err(e) = result {
            warn!(error = &e as &dyn Error, path = %path.display(), "Failed to remove cache entry");
        }
    }
    Ok(())
}

/// Moves `src` to `dst`, falling back to copy + delete when they are on different
/// filesystems.
pub async fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await.context("Failed to create destination directory")?;
    }
    if fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }
    debug!(src = %src.display(), dst = %dst.display(), "Rename failed, copying instead");
    fs::copy(src, dst).await.with_context(|| format!("Failed to copy to {}", dst.display()))?;
    fs::remove_file(src).await.context("Failed to remove source after copy")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn md5_matches_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(compute_md5_file(&path).await.unwrap(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clear_dir_keeps_directory() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(cache.join("nested")).unwrap();
        std::fs::write(cache.join("a.part"), b"x").unwrap();
        std::fs::write(cache.join("nested/b"), b"y").unwrap();

        clear_dir(&cache).await.unwrap();
        assert!(cache.is_dir());
        assert_eq!(std::fs::read_dir(&cache).unwrap().count(), 0);

        clear_dir(&dir.path().join("missing")).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn move_file_creates_parent() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("downloads/dst.bin");
        std::fs::write(&src, b"payload").unwrap();

        move_file(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
    }
}
