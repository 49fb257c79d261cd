//! nftables backend: per-uid egress filtering in an `inet appfence` table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{EnforcementMode, EnforcementSurface};
use crate::cmd_abstraction::{args_to_strings, CommandExecutor};
use crate::error::AppFenceError;
use crate::sources::PackageCatalog;

const NFT: &str = "nft";
const TABLE_NAME: &str = "appfence";
const SET_NAME: &str = "blocked_uids";

/// Drops outgoing traffic of the sockets owned by blocked application uids.
///
/// Package ids are mapped to uids through the catalog on every `start`, so
/// reinstalled applications pick up their new uid on the next sync.
pub struct NftablesSurface<E: CommandExecutor> {
    catalog: Arc<dyn PackageCatalog>,
    self_id: String,
    executor: E,
}

impl<E: CommandExecutor> NftablesSurface<E> {
    pub fn new(catalog: Arc<dyn PackageCatalog>, self_id: &str, executor: E) -> Self {
        Self {
            catalog,
            self_id: self_id.to_string(),
            executor,
        }
    }

    /// Uids whose egress must be dropped for `mode`.
    async fn blocked_uids(&self, mode: EnforcementMode, packages: &BTreeSet<String>) -> Result<BTreeSet<u32>> {
        let installed = self
            .catalog
            .installed()
            .await
            .context("Failed to list installed applications")?;
        let uid_by_package: HashMap<&str, u32> = installed
            .iter()
            .filter_map(|app| app.uid.map(|uid| (app.package_id.as_str(), uid)))
            .collect();
        let self_uid = uid_by_package.get(self.self_id.as_str()).copied();

        let mut uids = BTreeSet::new();
        if mode == EnforcementMode::Blocking {
            uids.extend(uid_by_package.values().copied());
        }
        for package in packages {
            match uid_by_package.get(package.as_str()) {
                Some(uid) => {
                    uids.insert(*uid);
                }
                None => warn!("No uid known for {}, it cannot be blocked", package),
            }
        }
        if let Some(uid) = self_uid {
            uids.remove(&uid);
        }
        Ok(uids)
    }

    fn generate_apply_script(&self, mode: EnforcementMode, uids: &BTreeSet<u32>) -> String {
        let mut script = String::new();

        // add + flush keeps the table in place while its content is swapped
        script.push_str(&format!("add table inet {}\n", TABLE_NAME));
        script.push_str(&format!("flush table inet {}\n", TABLE_NAME));

        script.push_str(&format!("table inet {} {{\n", TABLE_NAME));
        script.push_str(&format!("    comment \"mode {}\"\n", mode.as_str()));
        script.push_str(&format!("    set {} {{\n", SET_NAME));
        script.push_str("        type uid\n");
        if !uids.is_empty() {
            let elements: Vec<String> = uids.iter().map(|uid| uid.to_string()).collect();
            script.push_str(&format!("        elements = {{ {} }}\n", elements.join(", ")));
        }
        script.push_str("    }\n\n");

        script.push_str("    chain output {\n");
        script.push_str("        type filter hook output priority 0; policy accept;\n");
        script.push_str("        oifname \"lo\" accept\n");
        script.push_str(&format!(
            "        meta skuid @{} counter log prefix \"AppFence-Blocked: \" reject\n",
            SET_NAME
        ));
        script.push_str("    }\n");
        script.push_str("}\n");
        script
    }

    fn generate_remove_script(&self) -> String {
        format!("delete table inet {}\n", TABLE_NAME)
    }

    fn exec_nft_script(&self, script: &str) -> Result<()> {
        debug!("Executing nft script:\n{}", script);
        let output = self
            .executor
            .execute_with_stdin(NFT, &args_to_strings(&["-f", "-"]), script)?;
        if !output.success {
            return Err(AppFenceError::Enforcement(format!("nft failed: {}", output.stderr.trim())).into());
        }
        Ok(())
    }

    fn table_exists(&self) -> bool {
        self.executor
            .execute(NFT, &args_to_strings(&["list", "table", "inet", TABLE_NAME]))
            .map(|o| o.success)
            .unwrap_or(false)
    }
}

#[async_trait]
impl<E: CommandExecutor> EnforcementSurface for NftablesSurface<E> {
    async fn start(&self, mode: EnforcementMode, packages: &BTreeSet<String>) -> Result<()> {
        let uids = self.blocked_uids(mode, packages).await?;
        let script = self.generate_apply_script(mode, &uids);
        self.exec_nft_script(&script)?;
        info!(
            "Applied nftables {} rules for {} packages ({} uids)",
            mode.as_str(),
            packages.len(),
            uids.len()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.table_exists() {
            self.exec_nft_script(&self.generate_remove_script())?;
            info!("Removed nftables table inet {}", TABLE_NAME);
        }
        Ok(())
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(self.table_exists())
    }

    fn name(&self) -> &'static str {
        "nftables"
    }
}
