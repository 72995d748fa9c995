//! Resolved configuration of a login invocation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::issuer::IssuerConfig;
use crate::login::LoginFlags;
use crate::{Error, Result};

/// Environment variable listing kubeconfig files.
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Environment variable holding a pre-issued bearer token.
pub const TOKEN_ENV: &str = "FLEET_LOGIN_TOKEN";

pub const DEFAULT_CERTIFICATE_TTL: &str = "1h";

/// Everything a login run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct LoginConfig {
    pub store_path: PathBuf,
    /// Directory CA files of management clusters are written to.
    pub cert_dir: PathBuf,
    pub flags: LoginFlags,
    pub issuer: IssuerConfig,
}

impl LoginConfig {
    pub fn new(kubeconfig: Option<&str>, flags: LoginFlags, issuer: IssuerConfig) -> Result<Self> {
        validate_ttl(&flags.certificate_ttl)?;
        if issuer.poll_interval.is_zero() {
            return Err(Error::InvalidArguments(
                "the poll interval must be greater than zero".to_string(),
            ));
        }

        let store_path = resolve_store_path(kubeconfig)?;
        let cert_dir = cert_dir_for(&store_path);
        Ok(Self {
            store_path,
            cert_dir,
            flags,
            issuer,
        })
    }
}

/// Path of the shared kubeconfig.
///
/// An explicit value may be a path list, as in `KUBECONFIG`; its first entry
/// is the file written to. Without one, `~/.kube/config` is used.
pub fn resolve_store_path(explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(paths) = explicit.filter(|p| !p.trim().is_empty()) {
        if let Some(first) = std::env::split_paths(paths).find(|p| !p.as_os_str().is_empty()) {
            return Ok(first);
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".kube").join("config"))
        .ok_or_else(|| {
            Error::InvalidArguments(format!(
                "could not determine the home directory, set --kubeconfig or {KUBECONFIG_ENV}"
            ))
        })
}

fn cert_dir_for(store_path: &Path) -> PathBuf {
    match store_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Parse a certificate TTL such as `1h`, `30m` or `3600s`.
pub fn validate_ttl(ttl: &str) -> Result<Duration> {
    let invalid = || {
        Error::InvalidArguments(format!(
            "invalid certificate TTL '{ttl}', expected e.g. 1h, 30m, 3600s"
        ))
    };

    let s = ttl.trim();
    let (number, unit) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&s[..i], c),
        _ => (s, 's'),
    };
    let n: u64 = number.parse().map_err(|_| invalid())?;
    let seconds = match unit {
        'h' => n.checked_mul(3600),
        'm' => n.checked_mul(60),
        's' => Some(n),
        _ => None,
    }
    .ok_or_else(invalid)?;

    if seconds == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(seconds))
}
