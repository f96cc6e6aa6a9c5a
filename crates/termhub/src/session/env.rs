//! Environment policy for spawned shells.
//!
//! A shell inherits the daemon's ambient environment minus
//! deployment-internal variables, plus fixed terminal and locale defaults.

use std::collections::BTreeMap;

use crate::config::EnvironmentConfig;

/// Variables that never reach a shell. A trailing `*` matches a prefix.
const DENIED: &[&str] = &[
    "TERMHUB_*",
    "DATABASE_URL",
    "REDIS_URL",
    "SESSION_SECRET",
    "COOKIE_SECRET",
    "JWT_SECRET",
    "INTERNAL_API_TOKEN",
    "PORT",
    "HOST",
];

/// Variables always passed through, even when a deny rule matches.
const PASSTHROUGH: &[&str] = &[
    "TERM",
    "COLORTERM",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "LC_MESSAGES",
    "SSH_AUTH_SOCK",
    "SSH_AGENT_PID",
    "GPG_AGENT_INFO",
    "GPG_TTY",
];

const TERM_VALUE: &str = "xterm-256color";
const COLORTERM_VALUE: &str = "truecolor";
const DEFAULT_LANG: &str = "en_US.UTF-8";

/// Filters and completes the environment of a spawned shell.
#[derive(Debug, Clone)]
pub struct EnvPolicy {
    deny: Vec<String>,
    passthrough: Vec<String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self {
            deny: DENIED.iter().map(|s| s.to_string()).collect(),
            passthrough: PASSTHROUGH.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EnvPolicy {
    /// Builds the built-in policy extended by configured rules.
    pub fn from_config(config: &EnvironmentConfig) -> Self {
        let mut policy = Self::default();
        policy.deny.extend(config.deny.iter().cloned());
        policy.passthrough.extend(config.passthrough.iter().cloned());
        policy
    }

    /// Returns whether `name` may be inherited from the ambient environment.
    pub fn allows(&self, name: &str) -> bool {
        if self.passthrough.iter().any(|p| p == name) {
            return true;
        }
        !self.deny.iter().any(|rule| match rule.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => rule == name,
        })
    }

    /// Computes the environment for a new shell.
    ///
    /// `ambient` is filtered through the policy, `requested` is applied on top
    /// as given, then terminal capabilities are forced and a locale default is
    /// added when none is present.
    pub fn build<I>(&self, ambient: I, requested: &[(String, String)]) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env: BTreeMap<String, String> = ambient
            .into_iter()
            .filter(|(name, _)| self.allows(name))
            .collect();

        for (name, value) in requested {
            env.insert(name.clone(), value.clone());
        }

        env.insert("TERM".to_string(), TERM_VALUE.to_string());
        env.insert("COLORTERM".to_string(), COLORTERM_VALUE.to_string());
        env.entry("LANG".to_string())
            .or_insert_with(|| DEFAULT_LANG.to_string());

        env
    }
}
