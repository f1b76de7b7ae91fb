//! Backend hook scripts: DNS up/down and the no-op block hook.

use crate::profile::auth::write_artifact;
use crate::profile::types::ProfileError;
use std::path::{Path, PathBuf};

/// Linux hooks for hosts whose resolver is systemd-resolved.
const RESOLVED_SCRIPT: &str = r#"#!/bin/bash
# Applies pushed DNS settings through resolvectl.
set -u

case "${script_type:-}" in
  up)
    dns=()
    domains=()
    for opt in ${!foreign_option_*}; do
      read -r _ kind value <<< "${!opt}"
      case "$kind" in
        DNS) dns+=("$value") ;;
        DOMAIN|DOMAIN-SEARCH) domains+=("$value") ;;
      esac
    done
    if [ ${#dns[@]} -gt 0 ]; then
      resolvectl dns "$dev" "${dns[@]}"
      resolvectl domain "$dev" "~." "${domains[@]}"
      resolvectl default-route "$dev" true
    fi
    resolvectl flush-caches || true
    ;;
  down)
    resolvectl revert "$dev" || true
    resolvectl flush-caches || true
    ;;
esac
exit 0
"#;

/// Linux hooks for hosts using resolvconf.
const RESOLVCONF_SCRIPT: &str = r#"#!/bin/bash
# Registers pushed DNS settings with resolvconf.
set -u

case "${script_type:-}" in
  up)
    conf=""
    for opt in ${!foreign_option_*}; do
      read -r _ kind value <<< "${!opt}"
      case "$kind" in
        DNS) conf+="nameserver $value"$'\n' ;;
        DOMAIN|DOMAIN-SEARCH) conf+="search $value"$'\n' ;;
      esac
    done
    if [ -n "$conf" ]; then
      printf '%s' "$conf" | resolvconf -a "$dev.sorng" || true
    fi
    ;;
  down)
    resolvconf -d "$dev.sorng" || true
    ;;
esac
exit 0
"#;

/// macOS up hook: publishes pushed DNS in the dynamic store.
const DARWIN_UP_SCRIPT: &str = r#"#!/bin/bash
# Publishes pushed DNS settings in the macOS dynamic store.
set -u

servers=""
domains=""
for opt in ${!foreign_option_*}; do
  read -r _ kind value <<< "${!opt}"
  case "$kind" in
    DNS) servers="$servers $value" ;;
    DOMAIN|DOMAIN-SEARCH) domains="$domains $value" ;;
  esac
done

if [ -n "$servers" ]; then
  scutil <<EOF
d.init
d.add ServerAddresses *$servers
d.add SearchDomains *$domains
set State:/Network/SorngProfile/DNS
quit
EOF
  dscacheutil -flushcache || true
  killall -HUP mDNSResponder || true
fi
exit 0
"#;

/// macOS down hook: removes the dynamic store keys.
const DARWIN_DOWN_SCRIPT: &str = r#"#!/bin/bash
# Removes tunnel DNS settings from the macOS dynamic store.
scutil <<EOF
remove State:/Network/SorngProfile/DNS
quit
EOF
dscacheutil -flushcache || true
killall -HUP mDNSResponder || true
exit 0
"#;

const BLOCK_SCRIPT: &str = "#!/bin/sh\nexit 0\n";
const BLOCK_SCRIPT_WINDOWS: &str = "@echo off\r\nexit /b 0\r\n";

/// Which DNS hook variant a host needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlavor {
    Resolved,
    Resolvconf,
    Darwin,
}

impl HookFlavor {
    /// Variant for the current OS, or `None` where hooks are not used.
    pub fn detect(uses_systemd_resolved: bool) -> Option<Self> {
        if cfg!(target_os = "macos") {
            Some(Self::Darwin)
        } else if cfg!(target_os = "windows") {
            None
        } else if uses_systemd_resolved {
            Some(Self::Resolved)
        } else {
            Some(Self::Resolvconf)
        }
    }

    pub fn up_script(&self) -> &'static str {
        match self {
            Self::Resolved => RESOLVED_SCRIPT,
            Self::Resolvconf => RESOLVCONF_SCRIPT,
            Self::Darwin => DARWIN_UP_SCRIPT,
        }
    }

    pub fn down_script(&self) -> &'static str {
        match self {
            Self::Resolved => RESOLVED_SCRIPT,
            Self::Resolvconf => RESOLVCONF_SCRIPT,
            Self::Darwin => DARWIN_DOWN_SCRIPT,
        }
    }
}

/// Paths of the written up/down hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookPaths {
    pub up: PathBuf,
    pub down: PathBuf,
}

/// Write `<id>-up.sh` and `<id>-down.sh`.
pub fn write_hooks(dir: &Path, id: &str, flavor: HookFlavor) -> Result<HookPaths, ProfileError> {
    let up = write_artifact(&dir.join(format!("{}-up.sh", id)), flavor.up_script(), 0o755)?;
    let down = write_artifact(&dir.join(format!("{}-down.sh", id)), flavor.down_script(), 0o755)?;
    Ok(HookPaths { up, down })
}

/// Write the block hook, which always succeeds.
pub fn write_block(dir: &Path, id: &str) -> Result<PathBuf, ProfileError> {
    if cfg!(target_os = "windows") {
        write_artifact(&dir.join(format!("{}-block.bat", id)), BLOCK_SCRIPT_WINDOWS, 0o755)
    } else {
        write_artifact(&dir.join(format!("{}-block.sh", id)), BLOCK_SCRIPT, 0o755)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flavor_detection() {
        if cfg!(target_os = "linux") {
            assert_eq!(HookFlavor::detect(true), Some(HookFlavor::Resolved));
            assert_eq!(HookFlavor::detect(false), Some(HookFlavor::Resolvconf));
        }
    }

    #[test]
    fn linux_up_and_down_share_script() {
        assert_eq!(HookFlavor::Resolved.up_script(), HookFlavor::Resolved.down_script());
        assert_ne!(HookFlavor::Darwin.up_script(), HookFlavor::Darwin.down_script());
    }

    #[test]
    fn writes_hooks_with_exec_mode() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_hooks(dir.path(), "p1", HookFlavor::Resolvconf).unwrap();
        assert!(paths.up.ends_with("p1-up.sh"));
        assert!(paths.down.ends_with("p1-down.sh"));
        let body = std::fs::read_to_string(&paths.up).unwrap();
        assert!(body.starts_with("#!/bin/bash"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&paths.up).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn block_script_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_block(dir.path(), "p1").unwrap();
        let status = tokio::process::Command::new("sh").arg(&path).status().await.unwrap();
        assert!(status.success());
    }
}
