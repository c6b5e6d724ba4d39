use std::{
    env,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");
const ASSET_DIR_ENV: &str = "FINSIGHT_ASSET_DIR";

/// Directory holding the SQLite database and `config.json`.
///
/// `FINSIGHT_ASSET_DIR` wins, debug builds use `dev_assets/` at the workspace
/// root, release builds use the platform data directory.
pub fn asset_dir() -> PathBuf {
    if let Ok(custom_dir) = env::var(ASSET_DIR_ENV) {
        return PathBuf::from(custom_dir);
    }

    if cfg!(debug_assertions) {
        return PathBuf::from(PROJECT_ROOT).join("../../dev_assets");
    }

    match ProjectDirs::from("ai", "finsight", "finsight") {
        Some(dirs) => dirs.data_dir().to_path_buf(),
        None => {
            tracing::warn!("No home directory available, falling back to the temp dir for assets");
            env::temp_dir().join("finsight")
        }
    }
    // ✔ macOS → ~/Library/Application Support/finsight
    // ✔ Linux → ~/.local/share/finsight   (respects XDG_DATA_HOME)
    // ✔ Windows → %APPDATA%\finsight\finsight
}

/// Same as [`asset_dir`], creating the directory when it does not exist yet.
pub fn ensure_asset_dir() -> std::io::Result<PathBuf> {
    let path = asset_dir();
    ensure_dir(&path)?;
    Ok(path)
}

fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
        tracing::info!("Created asset directory: {}", path.display());
    }
    Ok(())
}

pub fn config_path() -> PathBuf {
    asset_dir().join("config.json")
}

pub fn database_path() -> PathBuf {
    asset_dir().join("db.sqlite")
}
