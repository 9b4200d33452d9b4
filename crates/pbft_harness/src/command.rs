//! Typed command lines for the external programs the harness drives.
//!
//! Commands are executed directly (no `sh -c`), but the node start line is
//! typed into a multiplexer pane where a shell does interpret it, so every
//! token is checked against a conservative character set before it is
//! serialized.

use std::fmt;

use crate::cluster::{validate_host, ClusterSet, ClusterTag};
use crate::error::{HarnessError, Result};
use crate::topology::LOCAL_OVERRIDE_HOST;

/// Program plus argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Splits a whitespace-separated line such as `go build -o app`.
    pub fn from_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| HarnessError::invalid("command line is empty"))?;
        let spec = Self::new(program).args(parts);
        spec.validate()?;
        Ok(spec)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    pub fn validate(&self) -> Result<()> {
        check_token(&self.program)?;
        for arg in &self.args {
            check_token(arg)?;
        }
        Ok(())
    }

    /// Space-joined line safe to type into an interactive shell.
    pub fn shell_line(&self) -> Result<String> {
        self.validate()?;
        Ok(self.to_string())
    }

    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn check_token(token: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || "._/:=@+-,".contains(c);
    if token.is_empty() || !token.chars().all(allowed) {
        return Err(HarnessError::invalid(format!(
            "command token {token:?} contains unsupported characters"
        )));
    }
    Ok(())
}

/// Builds `<script> <nodeCount> <clusterCount> <ip_1> ... <ip_k> <clusterTag>`.
///
/// The exercised cluster's IP is replaced with [`LOCAL_OVERRIDE_HOST`]; all
/// other clusters keep their real address.
#[derive(Debug, Clone)]
pub struct RemoteTrialBuilder<'a> {
    script: &'a str,
    clusters: &'a ClusterSet,
    server_ips: &'a [String],
    cluster_count: usize,
}

impl<'a> RemoteTrialBuilder<'a> {
    pub fn new(
        script: &'a str,
        clusters: &'a ClusterSet,
        server_ips: &'a [String],
        cluster_count: usize,
    ) -> Result<Self> {
        if server_ips.len() != clusters.len() {
            return Err(HarnessError::invalid(format!(
                "{} server ips configured for {} clusters",
                server_ips.len(),
                clusters.len()
            )));
        }
        for ip in server_ips {
            validate_host(ip)?;
        }
        if cluster_count == 0 || cluster_count > clusters.len() {
            return Err(HarnessError::invalid(format!(
                "cluster count {cluster_count} must be in 1..={}",
                clusters.len()
            )));
        }
        check_token(script)?;
        Ok(Self {
            script,
            clusters,
            server_ips,
            cluster_count,
        })
    }

    pub fn build(&self, node_count: usize, exercised: &ClusterTag) -> Result<CommandSpec> {
        if node_count == 0 {
            return Err(HarnessError::invalid("node count must be > 0"));
        }
        let ordinal = self.clusters.require(exercised)?;
        let ips = self.server_ips.iter().enumerate().map(|(i, ip)| {
            if i == ordinal {
                LOCAL_OVERRIDE_HOST.to_string()
            } else {
                ip.clone()
            }
        });
        let spec = CommandSpec::new(self.script)
            .arg(node_count.to_string())
            .arg(self.cluster_count.to_string())
            .args(ips)
            .arg(exercised.as_str());
        spec.validate()?;
        Ok(spec)
    }
}
