//! `ipmitool`-backed management channel.
//!
//! Shells out to the standard IPMI client per operation. Credentials come
//! from the node record and never appear in errors or logs.

use async_trait::async_trait;
use tokio::process::Command;

use crate::node::Node;

use super::{ManagementChannel, ManagementError};

/// Management channel that invokes `ipmitool` for each operation.
#[derive(Debug, Clone)]
pub struct IpmitoolChannel {
    command: String,
}

impl IpmitoolChannel {
    /// Use `ipmitool` from `$PATH`, or the binary named by
    /// `MANDREL_IPMITOOL_PATH`.
    pub fn from_env() -> Self {
        Self {
            command: std::env::var("MANDREL_IPMITOOL_PATH")
                .unwrap_or_else(|_| "ipmitool".to_string()),
        }
    }

    fn base_args(node: &Node) -> Result<Vec<String>, ManagementError> {
        let host = node
            .ipmi_hostname
            .as_ref()
            .ok_or_else(|| ManagementError::NoCredentials(node.name.clone()))?;

        let mut args = vec!["-H".to_string(), host.clone()];
        if let Some(user) = &node.ipmi_username {
            args.push("-U".to_string());
            args.push(user.clone());
        }
        if let Some(password) = &node.ipmi_password {
            args.push("-P".to_string());
            args.push(password.clone());
        }
        Ok(args)
    }

    async fn chassis_power(&self, node: &Node, subcommand: &str) -> Result<String, ManagementError> {
        let mut args = Self::base_args(node)?;
        args.extend(["chassis", "power", subcommand].map(String::from));

        let output = Command::new(&self.command)
            .args(&args)
            .output()
            .await
            .map_err(|e| ManagementError::Transport {
                node: node.name.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ManagementError::Report {
                node: node.name.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Parse `chassis power status` output.
fn parse_power_status(output: &str) -> Option<bool> {
    let line = output.to_lowercase();
    if line.contains("is on") {
        Some(true)
    } else if line.contains("is off") {
        Some(false)
    } else {
        None
    }
}

#[async_trait]
impl ManagementChannel for IpmitoolChannel {
    async fn is_on(&self, node: &Node) -> Result<bool, ManagementError> {
        let output = self.chassis_power(node, "status").await?;
        parse_power_status(&output).ok_or_else(|| ManagementError::Report {
            node: node.name.clone(),
            message: format!("unrecognized power status output: {}", output.trim()),
        })
    }

    async fn power(&self, node: &Node, on: bool) -> Result<(), ManagementError> {
        self.chassis_power(node, if on { "on" } else { "off" })
            .await?;
        Ok(())
    }

    async fn reset(&self, node: &Node) -> Result<(), ManagementError> {
        self.chassis_power(node, "reset").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_power_status() {
        assert_eq!(parse_power_status("Chassis Power is on\n"), Some(true));
        assert_eq!(parse_power_status("Chassis Power is off\n"), Some(false));
        assert_eq!(parse_power_status("garbage"), None);
    }
}
