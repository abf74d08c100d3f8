use crate::address::RemoteAddress;
use crate::config::ProfileRegistry;
use crate::error::FloodError;
use crate::stage::{Stage, StageTree};
use async_recursion::async_recursion;
use std::path::{Path, PathBuf};
use tracing::info;

/// Copy mode: byte-copies a source file or directory into `staging` under
/// the destination identity, then moves each finished copy into `inbox` so
/// the server pipeline (live or a later run) takes over. The two-step dance
/// means `inbox` only ever sees fully written files.
pub async fn run_copy(
    tree: &StageTree,
    registry: &ProfileRegistry,
    source: &Path,
    destination: &RemoteAddress,
    recursive: bool,
) -> Result<u64, FloodError> {
    if registry.get(&destination.profile).is_none() {
        return Err(FloodError::Config(format!(
            "destination profile '{}' is not in the credentials file",
            destination.profile
        )));
    }

    let meta = tokio::fs::metadata(source).await.map_err(|e| {
        FloodError::Config(format!("cannot read source {}: {e}", source.display()))
    })?;

    let mut transfers: Vec<(PathBuf, RemoteAddress)> = Vec::new();
    if meta.is_dir() {
        if !recursive {
            return Err(FloodError::Config(format!(
                "{} is a directory; pass --recursive to copy it",
                source.display()
            )));
        }
        let mut files = Vec::new();
        relative_files(source, Path::new(""), &mut files).await?;
        for rel in files {
            let suffix = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            transfers.push((source.join(&rel), destination.join_key(&suffix)));
        }
    } else {
        transfers.push((source.to_path_buf(), destination.clone()));
    }

    // Copy everything into staging first; only complete copies get promoted.
    for (src, addr) in &transfers {
        let staged = tree.path_in(Stage::Staging, addr);
        if let Some(parent) = staged.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, &staged).await?;
        info!("📄 Staged {} as {}", src.display(), addr);
    }

    for (_, addr) in &transfers {
        tree.promote(addr).await?;
    }

    info!("✅ Copied {} file(s) into inbox", transfers.len());
    Ok(transfers.len() as u64)
}

#[async_recursion]
async fn relative_files(
    base: &Path,
    rel: &Path,
    out: &mut Vec<PathBuf>,
) -> Result<(), std::io::Error> {
    let mut entries = tokio::fs::read_dir(base.join(rel)).await?;
    while let Some(entry) = entries.next_entry().await? {
        let child = rel.join(entry.file_name());
        if entry.file_type().await?.is_dir() {
            relative_files(base, &child, out).await?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}
