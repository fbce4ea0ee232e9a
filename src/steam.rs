use crate::reconcile::Roots;
use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const GAME_NAME: &str = "Starbound";
pub const STEAM_APP_ID: &str = "211820";

pub fn roots_for(steam_root: &Path) -> Roots {
    Roots {
        source: steam_root
            .join("steamapps/workshop/content")
            .join(STEAM_APP_ID),
        target: steam_root
            .join("steamapps/common")
            .join(GAME_NAME)
            .join("mods"),
    }
}

pub fn detect_roots() -> Option<Roots> {
    let steam_root = find_steam_library()?;
    debug!(root = %steam_root.display(), "steam library detected");
    Some(roots_for(&steam_root))
}

fn find_steam_library() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = dirs_home() {
        candidates.push(home.join(".local/share/Steam"));
        candidates.push(home.join(".steam/steam"));
        candidates.push(home.join(".var/app/com.valvesoftware.Steam/.local/share/Steam"));
    }

    let mut libraries = Vec::new();
    for base in candidates {
        let vdf = base.join("steamapps/libraryfolders.vdf");
        if vdf.exists() {
            if let Ok(paths) = parse_steam_library_paths(&vdf) {
                libraries.extend(paths);
            }
        }
        libraries.push(base);
    }

    libraries
        .into_iter()
        .find(|lib| lib.join("steamapps/common").join(GAME_NAME).is_dir())
}

pub fn parse_steam_library_paths(path: &Path) -> Result<Vec<PathBuf>> {
    let raw = fs::read_to_string(path).context("read libraryfolders.vdf")?;
    Ok(library_paths(&raw))
}

fn library_paths(raw: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if !line.contains("\"path\"") {
            continue;
        }
        let parts: Vec<&str> = line.split('"').collect();
        if parts.len() >= 4 {
            paths.push(PathBuf::from(parts[3].replace("\\\\", "\\")));
        }
    }
    paths
}

fn dirs_home() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|base| base.home_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_follow_the_steam_layout() {
        let roots = roots_for(Path::new("/games/steam"));
        assert_eq!(
            roots.source,
            PathBuf::from("/games/steam/steamapps/workshop/content/211820")
        );
        assert_eq!(
            roots.target,
            PathBuf::from("/games/steam/steamapps/common/Starbound/mods")
        );
    }

    #[test]
    fn reads_library_paths_from_vdf() {
        let raw = r#""libraryfolders"
{
    "0"
    {
        "path"		"/home/me/.local/share/Steam"
        "label"		""
    }
    "1"
    {
        "path"		"D:\\SteamLibrary"
    }
}"#;
        assert_eq!(
            library_paths(raw),
            vec![
                PathBuf::from("/home/me/.local/share/Steam"),
                PathBuf::from("D:\\SteamLibrary"),
            ]
        );
    }
}
