use anyhow::bail;
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

const DB_FILE_NAME: &str = "LongFileName.db";

#[derive(Debug)]
pub struct Config {
    pub source: PathBuf,
    pub db_path: PathBuf,
}

impl Config {
    pub fn new(source: PathBuf) -> anyhow::Result<Self> {
        // Exposing the whole root through the shim crashes the mount anyway;
        // refuse up front.
        if source == PathBuf::from("/") {
            bail!("source can't be /");
        }
        Ok(Self {
            source,
            db_path: resolve_db_path(
                env::var_os("LFN_DB"),
                env::var_os("XDG_DATA_HOME"),
                env::var_os("HOME"),
            ),
        })
    }
}

/// Digest database location: explicit override, then the per-user data
/// directory, then the home-relative default.
fn resolve_db_path(
    explicit: Option<OsString>,
    xdg_data_home: Option<OsString>,
    home: Option<OsString>,
) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }
    if let Some(data_home) = xdg_data_home {
        return PathBuf::from(data_home).join(DB_FILE_NAME);
    }
    PathBuf::from(home.unwrap_or_else(|| OsString::from(".")))
        .join(".local/share")
        .join(DB_FILE_NAME)
}
