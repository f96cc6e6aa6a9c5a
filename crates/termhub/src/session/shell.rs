//! Shell selection for new sessions.
//!
//! The resolver never fails: it walks an allowlist of well-known shells and
//! degrades to the platform fallback when nothing better is installed.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Known POSIX shells, in order of preference.
const POSIX_SHELLS: &[&str] = &[
    "/bin/bash",
    "/usr/bin/bash",
    "/usr/local/bin/bash",
    "/opt/homebrew/bin/bash",
    "/bin/zsh",
    "/usr/bin/zsh",
    "/usr/local/bin/zsh",
    "/opt/homebrew/bin/zsh",
    "/usr/bin/fish",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/fish",
    "/bin/sh",
    "/usr/bin/sh",
];

/// Known console shells, in order of preference.
const CONSOLE_SHELLS: &[&str] = &[
    r"C:\Program Files\PowerShell\7\pwsh.exe",
    r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe",
];

/// Last resort on POSIX hosts.
const POSIX_FALLBACK: &str = "/bin/sh";

/// Last resort on console hosts.
const CONSOLE_FALLBACK: &str = "powershell.exe";

/// Host platform family, as far as shell selection is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Signal-capable hosts with a POSIX shell.
    Posix,
    /// Console-only hosts (Windows ConPTY).
    Console,
}

impl Platform {
    /// Returns the platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Console
        } else {
            Platform::Posix
        }
    }
}

/// A shell executable together with its startup arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellSpec {
    /// Path (or bare name) of the executable.
    pub program: PathBuf,
    /// Arguments passed on startup.
    pub args: Vec<String>,
}

impl ShellSpec {
    /// Builds a spec for a caller-chosen program.
    ///
    /// Without explicit `args` the canonical argument set for the program's
    /// base name is used.
    pub fn explicit(program: impl Into<PathBuf>, args: Option<Vec<String>>) -> Self {
        let program = program.into();
        let args = args.unwrap_or_else(|| canonical_args(&program, Platform::current()));
        Self { program, args }
    }
}

/// Returns the startup arguments conventionally used for `program`.
///
/// Login shells get `-l`; a bare POSIX `sh` and every console shell start
/// without flags.
pub fn canonical_args(program: &Path, platform: Platform) -> Vec<String> {
    if platform == Platform::Console {
        return Vec::new();
    }
    match base_name(program).as_deref() {
        Some("bash") | Some("zsh") | Some("fish") | Some("ksh") => vec!["-l".to_string()],
        _ => Vec::new(),
    }
}

fn base_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Chooses the shell for new sessions.
#[derive(Debug, Clone)]
pub struct ShellResolver {
    platform: Platform,
    allowlist: Vec<PathBuf>,
    preferred: Option<String>,
}

impl ShellResolver {
    /// Creates a resolver for the current platform with the built-in allowlist.
    pub fn new(preferred: Option<String>) -> Self {
        let platform = Platform::current();
        let allowlist = match platform {
            Platform::Posix => POSIX_SHELLS,
            Platform::Console => CONSOLE_SHELLS,
        };
        Self {
            platform,
            allowlist: allowlist.iter().map(PathBuf::from).collect(),
            preferred,
        }
    }

    /// Creates a resolver whose preference is `configured`, else `$SHELL`.
    pub fn from_env(configured: Option<&str>) -> Self {
        let preferred = configured
            .map(str::to_string)
            .or_else(|| std::env::var("SHELL").ok())
            .filter(|s| !s.is_empty());
        Self::new(preferred)
    }

    /// Overrides the platform and allowlist.
    pub fn with_allowlist(mut self, platform: Platform, allowlist: Vec<PathBuf>) -> Self {
        self.platform = platform;
        self.allowlist = allowlist;
        self
    }

    /// Returns the user-preferred shell, if any.
    pub fn preferred(&self) -> Option<&str> {
        self.preferred.as_deref()
    }

    /// Resolves the shell to spawn, probing the real filesystem.
    pub fn resolve(&self) -> ShellSpec {
        self.resolve_with(|path| path.exists())
    }

    /// Resolves the shell to spawn using `exists` as the filesystem probe.
    pub fn resolve_with(&self, exists: impl Fn(&Path) -> bool) -> ShellSpec {
        if self.platform != Platform::Console {
            if let Some(preferred) = self.preferred.as_deref() {
                if let Some(found) = self.match_preferred(preferred, &exists) {
                    return self.spec_for(found);
                }
                tracing::debug!(preferred = %preferred, "Preferred shell not allowlisted or missing");
            }
        }

        if let Some(found) = self.allowlist.iter().find(|path| exists(path)) {
            return self.spec_for(found.clone());
        }

        let fallback = match self.platform {
            Platform::Posix => POSIX_FALLBACK,
            Platform::Console => CONSOLE_FALLBACK,
        };
        tracing::warn!(fallback = %fallback, "No allowlisted shell found, using fallback");
        ShellSpec {
            program: PathBuf::from(fallback),
            args: Vec::new(),
        }
    }

    fn match_preferred(&self, preferred: &str, exists: &impl Fn(&Path) -> bool) -> Option<PathBuf> {
        let wanted = Path::new(preferred);
        let wanted_name = base_name(wanted);
        self.allowlist
            .iter()
            .filter(|candidate| {
                candidate.as_path() == wanted
                    || (wanted_name.is_some() && base_name(candidate) == wanted_name)
            })
            .find(|candidate| exists(candidate))
            .cloned()
    }

    fn spec_for(&self, program: PathBuf) -> ShellSpec {
        let args = canonical_args(&program, self.platform);
        ShellSpec { program, args }
    }
}
