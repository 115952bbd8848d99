//! IP-set manager that feeds an `ipset restore` script to the system binary.

use std::process::Stdio;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use pbr_resolver::{IpSetEntry, IpSetManager};
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

pub struct IpsetExec {
    binary: String,
}

impl IpsetExec {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }

    fn restore_script(entries: &[IpSetEntry]) -> String {
        let mut script = String::new();
        for entry in entries {
            script.push_str(&format!(
                "add -exist {} {} timeout {}\n",
                entry.set,
                entry.prefix(),
                entry.ttl
            ));
        }

        script
    }
}

#[async_trait]
impl IpSetManager for IpsetExec {
    async fn batch_add(&self, entries: &[IpSetEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let script = Self::restore_script(entries);

        let mut child = Command::new(&self.binary)
            .arg("restore")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {} restore", self.binary))?;

        let mut stdin = child.stdin.take().context("Child has no stdin")?;
        stdin
            .write_all(script.as_bytes())
            .await
            .context("Failed to write ipset restore script")?;
        drop(stdin); // Closing stdin lets `ipset restore` finish.

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for ipset")?;
        anyhow::ensure!(
            output.status.success(),
            "ipset restore failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_script_is_one_add_per_entry() {
        let entries = vec![
            IpSetEntry {
                set: "vpn4".to_owned(),
                ip: "1.2.3.4".parse().unwrap(),
                ttl: 420,
            },
            IpSetEntry {
                set: "vpn6".to_owned(),
                ip: "2001:db8::1".parse().unwrap(),
                ttl: 300,
            },
        ];

        assert_eq!(
            IpsetExec::restore_script(&entries),
            "add -exist vpn4 1.2.3.4/32 timeout 420\n\
             add -exist vpn6 2001:db8::1/128 timeout 300\n"
        );
    }
}
