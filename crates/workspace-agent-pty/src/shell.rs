//! Cross-platform shell detection.

use std::{
    ffi::OsStr,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shell name that does not map to a supported interpreter.
#[derive(Debug, Error)]
#[error("Unsupported shell: {0}")]
pub struct UnknownShell(pub String);

/// Interpreters the agent knows how to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Bash,
    Zsh,
    Sh,
    Fish,
    PowerShell,
    Pwsh,
    Cmd,
}

impl ShellKind {
    /// Every known shell, in preference order.
    pub const ALL: [Self; 7] = [
        Self::Bash,
        Self::Zsh,
        Self::Fish,
        Self::Sh,
        Self::Pwsh,
        Self::PowerShell,
        Self::Cmd,
    ];

    /// Protocol name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Zsh => "zsh",
            Self::Sh => "sh",
            Self::Fish => "fish",
            Self::PowerShell => "powershell",
            Self::Pwsh => "pwsh",
            Self::Cmd => "cmd",
        }
    }

    /// Executable name looked up on PATH.
    #[must_use]
    pub const fn program(self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Zsh => "zsh",
            Self::Sh => "sh",
            Self::Fish => "fish",
            Self::PowerShell => "powershell.exe",
            Self::Pwsh => "pwsh",
            Self::Cmd => "cmd.exe",
        }
    }

    /// Whether the shell accepts `-l` to run as a login shell.
    #[must_use]
    pub const fn supports_login(self) -> bool {
        matches!(self, Self::Bash | Self::Zsh | Self::Fish)
    }

    /// Whether the shell only exists on Windows.
    #[must_use]
    pub const fn windows_only(self) -> bool {
        matches!(self, Self::PowerShell | Self::Cmd)
    }

    /// Shells worth probing on the current platform.
    pub fn candidates() -> impl Iterator<Item = Self> {
        Self::ALL
            .into_iter()
            .filter(|shell| cfg!(windows) || !shell.windows_only())
    }

    /// Classify an interpreter by its path or file name.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_stem()
            .and_then(OsStr::to_str)
            .and_then(|stem| stem.parse().ok())
    }
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShellKind {
    type Err = UnknownShell;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let name = Path::new(trimmed)
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or(trimmed)
            .to_ascii_lowercase();
        let name = name.strip_suffix(".exe").unwrap_or(&name);
        match name {
            "bash" => Ok(Self::Bash),
            "zsh" => Ok(Self::Zsh),
            "sh" => Ok(Self::Sh),
            "fish" => Ok(Self::Fish),
            "powershell" => Ok(Self::PowerShell),
            "pwsh" => Ok(Self::Pwsh),
            "cmd" => Ok(Self::Cmd),
            _ => Err(UnknownShell(s.to_string())),
        }
    }
}

/// The shell used when a request does not name one.
///
/// On Windows, PowerShell. On Unix, the user's `$SHELL` when it is a known
/// interpreter, falling back to `sh`.
#[must_use]
pub fn default_shell() -> ShellKind {
    if cfg!(windows) {
        return ShellKind::PowerShell;
    }
    std::env::var_os("SHELL")
        .and_then(|shell| ShellKind::from_path(Path::new(&shell)))
        .unwrap_or(ShellKind::Sh)
}

/// Shells found on this machine, in preference order.
pub async fn available_shells() -> Vec<ShellKind> {
    let mut found = Vec::new();
    for shell in ShellKind::candidates() {
        if resolve_executable_path(shell.program()).await.is_some() {
            found.push(shell);
        }
    }
    found
}

/// Resolve an executable by name.
///
/// Absolute paths are accepted as-is when they exist; anything else is
/// looked up on the current PATH.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    which_async(executable).await
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names_and_paths() {
        assert_eq!("bash".parse::<ShellKind>().unwrap(), ShellKind::Bash);
        assert_eq!("/usr/bin/zsh".parse::<ShellKind>().unwrap(), ShellKind::Zsh);
        assert_eq!("PowerShell.exe".parse::<ShellKind>().unwrap(), ShellKind::PowerShell);
        assert_eq!("cmd".parse::<ShellKind>().unwrap(), ShellKind::Cmd);
        assert!("tcsh".parse::<ShellKind>().is_err());
    }

    #[test]
    fn test_serde_uses_protocol_names() {
        let json = serde_json::to_string(&ShellKind::PowerShell).unwrap();
        assert_eq!(json, "\"powershell\"");
        let parsed: ShellKind = serde_json::from_str("\"pwsh\"").unwrap();
        assert_eq!(parsed, ShellKind::Pwsh);
    }

    #[test]
    fn test_display_matches_protocol_name() {
        for shell in ShellKind::ALL {
            assert_eq!(shell.to_string().parse::<ShellKind>().unwrap(), shell);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sh_is_available_on_unix() {
        let shells = available_shells().await;
        assert!(shells.contains(&ShellKind::Sh));
        assert!(!shells.contains(&ShellKind::Cmd));
    }

    #[tokio::test]
    async fn test_resolve_rejects_empty() {
        assert!(resolve_executable_path("  ").await.is_none());
        assert!(resolve_executable_path("/definitely/not/here").await.is_none());
    }
}
