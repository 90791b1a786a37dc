//! License file resolution.
//!
//! A node refuses to initialize without a license, so resolution failures
//! are fatal at cluster construction time, before any container engine
//! call is made.

use std::env;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};

/// Environment variable pointing at a license file.
pub const LICENSE_ENV: &str = "VOLTDB_LICENSE";

/// File name searched for in the fallback locations.
const LICENSE_FILE_NAME: &str = "license.xml";

/// Resolves the license file to use for a cluster.
///
/// An explicit path, when given, must exist. Otherwise the standard
/// locations are searched in order: the `VOLTDB_LICENSE` environment
/// variable, `$HOME/license.xml`, then `license.xml` in the system temp
/// directory. Failing all of those, the error enumerates the searched
/// fallback paths.
pub fn resolve_license(explicit: Option<&Path>) -> Result<PathBuf> {
    resolve_from(
        explicit,
        env::var_os(LICENSE_ENV).map(PathBuf::from),
        env::var_os("HOME").map(PathBuf::from),
        env::temp_dir(),
    )
}

fn resolve_from(
    explicit: Option<&Path>,
    from_env: Option<PathBuf>,
    home: Option<PathBuf>,
    temp_dir: PathBuf,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            info!(path = %path.display(), "using explicitly configured license file");
            return Ok(path.to_path_buf());
        }
        return Err(Error::LicenseMissing(path.to_path_buf()));
    }

    if let Some(path) = from_env {
        if path.exists() {
            info!(path = %path.display(), "using license file from {LICENSE_ENV}");
            return Ok(path);
        }
    }

    let in_home = home.map(|h| h.join(LICENSE_FILE_NAME));
    if let Some(path) = &in_home {
        if path.exists() {
            info!(path = %path.display(), "using license file from home directory");
            return Ok(path.clone());
        }
    }

    let in_temp = temp_dir.join(LICENSE_FILE_NAME);
    if in_temp.exists() {
        info!(path = %in_temp.display(), "using license file from temp directory");
        return Ok(in_temp);
    }

    let mut searched: Vec<PathBuf> = Vec::new();
    if let Some(path) = in_home {
        searched.push(path);
    }
    searched.push(in_temp);
    Err(Error::LicenseNotFound(searched))
}
