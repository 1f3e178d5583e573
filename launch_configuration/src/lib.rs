//! Named backend configurations, loaded from a JSONC file.
//!
//! The file holds a list of configurations; comments and trailing commas
//! are fine, people edit these by hand:
//!
//! ```jsonc
//! {
//!     "version": "1",
//!     "backends": [
//!         // the default local interpreter
//!         { "name": "local", "kind": "local", "executable": "wirebug-backend" },
//!         { "name": "lab", "kind": "ssh", "host": "lab.example.edu", "user": "s123" },
//!     ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eyre::WrapErr;
use serde::Deserialize;
use server::LaunchOptions;

/// Name of the remote backend executable when none is configured.
pub const DEFAULT_BACKEND_COMMAND: &str = "wirebug-backend";

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(rename = "version")]
    _version: Option<String>,
    backends: Vec<LaunchConfiguration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchConfiguration {
    Local(LocalConfiguration),
    Ssh(SshConfiguration),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfiguration {
    pub name: String,
    /// Backend executable; resolved through `PATH` when not absolute.
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfiguration {
    pub name: String,
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Command starting the backend on the remote host.
    pub command: Option<String>,
}

impl LaunchConfiguration {
    pub fn name(&self) -> &str {
        match self {
            LaunchConfiguration::Local(c) => &c.name,
            LaunchConfiguration::Ssh(c) => &c.name,
        }
    }

    pub fn to_launch_options(&self) -> LaunchOptions {
        match self {
            LaunchConfiguration::Local(c) => LaunchOptions::Local {
                executable: c
                    .executable
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BACKEND_COMMAND.into()),
                args: c.args.clone(),
                cwd: c.cwd.clone(),
                env: c.env.clone(),
            },
            LaunchConfiguration::Ssh(c) => LaunchOptions::Ssh {
                host: c.host.clone(),
                user: c.user.clone(),
                port: c.port,
                remote_command: c
                    .command
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BACKEND_COMMAND.to_owned()),
            },
        }
    }
}

pub fn load(
    name: impl AsRef<str>,
    mut r: impl std::io::Read,
) -> eyre::Result<Option<LaunchConfiguration>> {
    let mut contents = String::new();
    r.read_to_string(&mut contents)
        .wrap_err("reading configuration contents")?;
    from_str(name, &contents)
}

pub fn load_from_path(
    name: impl AsRef<str>,
    path: impl AsRef<Path>,
) -> eyre::Result<Option<LaunchConfiguration>> {
    let f = std::fs::File::open(path.as_ref())
        .wrap_err_with(|| format!("opening {}", path.as_ref().display()))?;
    load(name, f)
}

fn from_str(name: impl AsRef<str>, contents: &str) -> eyre::Result<Option<LaunchConfiguration>> {
    let config = jsonc_to_serde(contents).wrap_err("parsing launch configuration")?;
    let name = name.as_ref();
    Ok(config
        .backends
        .into_iter()
        .find(|configuration| configuration.name() == name))
}

fn jsonc_to_serde(input: &str) -> eyre::Result<ConfigFile> {
    let value = jsonc_parser::parse_to_serde_value(input, &Default::default())
        .wrap_err("parsing jsonc text")?;
    let Some(value) = value else {
        eyre::bail!("no configuration found");
    };
    serde_json::from_value(value).wrap_err("deserializing configuration value")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    {
        "version": "1",
        "backends": [
            // day-to-day interpreter
            {
                "name": "local",
                "kind": "local",
                "executable": "/opt/wirebug/bin/wirebug-backend",
                "env": { "RUST_LOG": "info" },
            },
            {
                "name": "lab",
                "kind": "ssh",
                "host": "lab.example.edu",
                "user": "s123",
                "port": 2222,
            },
        ]
    }
    "#;

    #[test]
    fn finds_a_local_configuration_by_name() {
        let config = from_str("local", SAMPLE).unwrap().expect("a configuration");
        match &config {
            LaunchConfiguration::Local(c) => {
                assert_eq!(
                    c.executable.as_deref(),
                    Some(Path::new("/opt/wirebug/bin/wirebug-backend"))
                );
                assert_eq!(c.env["RUST_LOG"], "info");
            }
            other => panic!("unexpected configuration {other:?}"),
        }
        assert!(matches!(
            config.to_launch_options(),
            LaunchOptions::Local { .. }
        ));
    }

    #[test]
    fn finds_an_ssh_configuration_with_default_command() {
        let config = from_str("lab", SAMPLE).unwrap().expect("a configuration");
        match config.to_launch_options() {
            LaunchOptions::Ssh {
                host,
                user,
                port,
                remote_command,
            } => {
                assert_eq!(host, "lab.example.edu");
                assert_eq!(user.as_deref(), Some("s123"));
                assert_eq!(port, Some(2222));
                assert_eq!(remote_command, DEFAULT_BACKEND_COMMAND);
            }
            other => panic!("unexpected options {other:?}"),
        }
    }

    #[test]
    fn unknown_name_is_none() {
        assert!(from_str("nope", SAMPLE).unwrap().is_none());
    }

    #[test]
    fn comments_and_trailing_commas_are_tolerated() {
        // would be a parse error for strict json
        assert!(from_str("local", SAMPLE).unwrap().is_some());
    }

    #[test]
    fn malformed_text_is_an_error() {
        assert!(from_str("local", "{ not json").is_err());
    }
}
