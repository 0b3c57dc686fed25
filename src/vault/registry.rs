use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::core::config::Config;
use crate::vault::filesystem::{
    ClientFactory, HdfsFileSystem, ObjectStoreFileSystem, PathFormat, VaultFileSystem, VaultInfo,
};

/// A named remote storage backend: its filesystem handle plus the key layout
/// rowsets are written under.
#[derive(Clone)]
pub struct StorageVault {
    pub id: String,
    pub fs: Arc<VaultFileSystem>,
    pub path_format: PathFormat,
}

/// Registry of every vault this node reads and writes through, refreshed
/// periodically from the metadata service.
pub struct StorageVaultRegistry {
    vaults: RwLock<HashMap<String, StorageVault>>,
    latest: RwLock<Option<String>>,
    factory: ClientFactory,
    first_sync: AtomicBool,
}

impl StorageVaultRegistry {
    pub fn new(factory: ClientFactory) -> Self {
        StorageVaultRegistry {
            vaults: RwLock::new(HashMap::new()),
            latest: RwLock::new(None),
            factory,
            first_sync: AtomicBool::new(false),
        }
    }

    pub fn get_filesystem(&self, id: &str) -> Option<Arc<VaultFileSystem>> {
        self.vaults.read().get(id).map(|v| v.fs.clone())
    }

    pub fn get_vault(&self, id: &str) -> Option<StorageVault> {
        self.vaults.read().get(id).cloned()
    }

    /// The vault new data goes to when no table-level vault is configured.
    pub fn latest_fs(&self) -> Option<Arc<VaultFileSystem>> {
        let latest = self.latest.read();
        latest.as_ref().and_then(|id| self.get_filesystem(id))
    }

    pub fn vault_count(&self) -> usize {
        self.vaults.read().len()
    }

    /// Apply one fetched descriptor list: create filesystems for unknown
    /// ids, refresh known ones. A failing vault is logged and skipped so one
    /// bad descriptor cannot block the rest.
    pub fn sync(
        &self,
        vault_infos: &[(String, VaultInfo, PathFormat)],
        enable_storage_vault: bool,
        config: &Config,
    ) {
        if vault_infos.is_empty() {
            warn!("empty storage vault info");
            return;
        }

        // Only the very first sync health-checks role-based object stores.
        let check_fs = !self.first_sync.swap(true, Ordering::SeqCst)
            && config.enable_check_storage_vault;

        for (id, info, path_format) in vault_infos {
            let existing = self.get_filesystem(id);
            let result = match existing {
                None => self.create_vault(id, info, *path_format, check_fs),
                Some(fs) => self.refresh_vault(id, &fs, info, *path_format),
            };
            if let Err(e) = result {
                warn!(vault_id = %id, error = %e, "failed to sync storage vault");
            }
        }

        // Without vault-per-table routing, everything lands on the most
        // recently listed vault.
        if !enable_storage_vault {
            let last_id = &vault_infos[vault_infos.len() - 1].0;
            let mut latest = self.latest.write();
            if latest.as_deref() != Some(last_id.as_str()) && self.vaults.read().contains_key(last_id)
            {
                *latest = Some(last_id.clone());
            }
        }
    }

    fn create_vault(
        &self,
        id: &str,
        info: &VaultInfo,
        path_format: PathFormat,
        check_fs: bool,
    ) -> crate::core::error::Result<()> {
        let fs = match info {
            VaultInfo::ObjectStore(conf) => {
                info!(vault_id = %id, endpoint = %conf.endpoint, check_fs, "creating object store vault");
                let fs = ObjectStoreFileSystem::new(id, conf.clone(), self.factory.clone())?;
                let fs = VaultFileSystem::ObjectStore(fs);
                if check_fs && conf.role_arn.is_some() {
                    // Connectivity probe against an object that cannot exist;
                    // only the call itself must succeed.
                    if let Err(e) = fs.exists("not_exist_object") {
                        panic!(
                            "failed to check object store vault {id}: {e}; set \
                             enable_check_storage_vault=false to skip the check"
                        );
                    }
                }
                fs
            }
            VaultInfo::Hdfs(conf) => {
                let fs = HdfsFileSystem::new(id, conf.clone(), self.factory.clone())?;
                info!(vault_id = %id, fs_name = %conf.fs_name, "creating hdfs vault");
                VaultFileSystem::Hdfs(fs)
            }
        };
        self.put(id, fs, path_format);
        info!(vault_id = %id, "successfully created storage vault");
        Ok(())
    }

    fn refresh_vault(
        &self,
        id: &str,
        fs: &VaultFileSystem,
        info: &VaultInfo,
        path_format: PathFormat,
    ) -> crate::core::error::Result<()> {
        match (fs, info) {
            (VaultFileSystem::ObjectStore(object_fs), VaultInfo::ObjectStore(conf)) => {
                // Swap the credential holder in place; open readers keep
                // their handle.
                if let Err(e) = object_fs.holder().reset(conf.clone()) {
                    warn!(vault_id = %id, error = %e, "failed to refresh object store vault");
                    return Err(e);
                }
                Ok(())
            }
            (VaultFileSystem::Hdfs(_), VaultInfo::Hdfs(conf)) => {
                // HDFS parameters only take effect on a fresh filesystem.
                let fresh = HdfsFileSystem::new(id, conf.clone(), self.factory.clone())?;
                self.put(id, VaultFileSystem::Hdfs(fresh), path_format);
                Ok(())
            }
            _ => Err(crate::core::error::Error::internal(format!(
                "vault {id} changed kind between syncs"
            ))),
        }
    }

    fn put(&self, id: &str, fs: VaultFileSystem, path_format: PathFormat) {
        let vault = StorageVault {
            id: id.to_string(),
            fs: Arc::new(fs),
            path_format,
        };
        self.vaults.write().insert(id.to_string(), vault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::filesystem::{HdfsConf, InMemoryClient, ObjectStoreConf};

    fn object_info(key: &str) -> VaultInfo {
        VaultInfo::ObjectStore(ObjectStoreConf {
            endpoint: "http://127.0.0.1:9000".to_string(),
            region: "local".to_string(),
            bucket: "bucket".to_string(),
            prefix: "prefix".to_string(),
            access_key: key.to_string(),
            secret_key: "sk".to_string(),
            role_arn: None,
            external_id: None,
        })
    }

    fn hdfs_info(fs_name: &str) -> VaultInfo {
        VaultInfo::Hdfs(HdfsConf {
            fs_name: fs_name.to_string(),
            username: None,
            prefix: "warehouse".to_string(),
            properties: HashMap::new(),
        })
    }

    #[test]
    fn test_sync_registers_every_vault_once() {
        let registry = StorageVaultRegistry::new(InMemoryClient::factory());
        let infos = vec![
            ("v1".to_string(), object_info("ak1"), PathFormat::default()),
            ("v2".to_string(), hdfs_info("hdfs://nn1"), PathFormat::default()),
        ];
        let config = Config { enable_check_storage_vault: false, ..Config::default() };
        registry.sync(&infos, true, &config);
        assert_eq!(registry.vault_count(), 2);
        assert!(registry.get_filesystem("v1").is_some());
        assert!(registry.get_filesystem("v2").is_some());
        // No latest vault selected when vault routing is enabled.
        assert!(registry.latest_fs().is_none());

        registry.sync(&infos, true, &config);
        assert_eq!(registry.vault_count(), 2);
    }

    #[test]
    fn test_sync_refresh_updates_credentials() {
        let registry = StorageVaultRegistry::new(InMemoryClient::factory());
        let config = Config { enable_check_storage_vault: false, ..Config::default() };
        registry.sync(
            &[("v1".to_string(), object_info("old"), PathFormat::default())],
            false,
            &config,
        );
        registry.sync(
            &[("v1".to_string(), object_info("new"), PathFormat::default())],
            false,
            &config,
        );
        let vault = registry.get_vault("v1").unwrap();
        match vault.fs.as_ref() {
            VaultFileSystem::ObjectStore(fs) => {
                assert_eq!(fs.holder().conf().access_key, "new")
            }
            VaultFileSystem::Hdfs(_) => panic!("expected object store vault"),
        }
    }

    #[test]
    fn test_latest_vault_follows_last_entry() {
        let registry = StorageVaultRegistry::new(InMemoryClient::factory());
        let config = Config { enable_check_storage_vault: false, ..Config::default() };
        registry.sync(
            &[
                ("v1".to_string(), object_info("a"), PathFormat::default()),
                ("v2".to_string(), object_info("b"), PathFormat::default()),
            ],
            false,
            &config,
        );
        assert_eq!(registry.latest_fs().unwrap().id(), "v2");
    }

    #[test]
    fn test_empty_sync_is_noop() {
        let registry = StorageVaultRegistry::new(InMemoryClient::factory());
        registry.sync(&[], false, &Config::default());
        assert_eq!(registry.vault_count(), 0);
    }
}
