//! Stdio server launch configuration
//!
//! [`ServerConfig`] describes how to launch an MCP server subprocess:
//! executable, arguments, environment, and working directory. The structure
//! is `serde`-derived so external configuration loaders can deserialize it
//! from whatever document format they use; the transport consumes it
//! verbatim.
//!
//! Environment values may reference parent-process variables as `${NAME}`;
//! references are resolved at open time and unresolved references keep
//! their literal text.

use std::collections::HashMap;
use std::path::PathBuf;

/// Launch parameters for a stdio MCP server subprocess.
///
/// # Examples
///
/// ```
/// use xzmcp::config::ServerConfig;
///
/// let config = ServerConfig::new("npx")
///     .args(["-y", "@modelcontextprotocol/server-filesystem", "/tmp"])
///     .env("API_KEY", "${HOME}/secret");
/// assert_eq!(config.command, "npx");
/// ```
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerConfig {
    /// Path or name of the server executable.
    pub command: String,
    /// Command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the child process; values may contain
    /// `${NAME}` references to the parent environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Working directory for the child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl ServerConfig {
    /// Create a configuration for the given executable with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: None,
            cwd: None,
        }
    }

    /// Replace the argument list.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// The environment map with `${NAME}` references resolved against the
    /// parent process environment.
    pub fn resolved_env(&self) -> HashMap<String, String> {
        self.env
            .as_ref()
            .map(|env| {
                env.iter()
                    .map(|(k, v)| (k.clone(), expand_env_refs(v)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Expand `${NAME}` references in `value` from the parent environment.
///
/// References to unset variables are preserved literally, so a config can
/// carry placeholder text through to the child unchanged.
pub fn expand_env_refs(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(resolved) => out.push_str(&resolved),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference: keep the rest verbatim.
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}
