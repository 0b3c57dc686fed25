use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::meta::rowset::RowsetId;

/// How object keys are laid out under a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathFormat {
    pub path_version: i32,
    pub shard_num: i32,
}

impl Default for PathFormat {
    fn default() -> Self {
        PathFormat { path_version: 0, shard_num: 0 }
    }
}

impl PathFormat {
    pub fn segment_path(&self, tablet_id: i64, rowset_id: &RowsetId, segment_id: u32) -> String {
        match self.path_version {
            0 => format!("data/{tablet_id}/{rowset_id}_{segment_id}.dat"),
            _ => {
                let shard = if self.shard_num > 0 {
                    (tablet_id % self.shard_num as i64).unsigned_abs()
                } else {
                    0
                };
                format!("data/{shard}/{tablet_id}/{rowset_id}/{segment_id}.dat")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreConf {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub prefix: String,
    pub access_key: String,
    pub secret_key: String,
    pub role_arn: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HdfsConf {
    pub fs_name: String,
    pub username: Option<String>,
    pub prefix: String,
    pub properties: HashMap<String, String>,
}

/// Vault descriptor as fetched from the metadata service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VaultInfo {
    ObjectStore(ObjectStoreConf),
    Hdfs(HdfsConf),
}

/// Transport a vault filesystem talks through. Real deployments inject an
/// S3 or HDFS client; tests use the in-memory one.
pub trait ObjectClient: Send + Sync {
    fn exists(&self, path: &str) -> Result<bool>;
    fn read(&self, path: &str) -> Result<Bytes>;
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;
    fn append(&self, path: &str, data: &[u8]) -> Result<()>;
    fn delete(&self, path: &str) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub type ClientFactory =
    Arc<dyn Fn(&VaultInfo) -> Result<Arc<dyn ObjectClient>> + Send + Sync>;

/// Holds the live client for an object-store vault. `reset` swaps
/// credentials atomically; consumers keep using the holder and pick up the
/// new client on their next operation, without reconnecting.
pub struct ClientHolder {
    conf: Mutex<ObjectStoreConf>,
    client: RwLock<Arc<dyn ObjectClient>>,
    factory: ClientFactory,
}

impl ClientHolder {
    pub fn new(conf: ObjectStoreConf, factory: ClientFactory) -> Result<Self> {
        let client = factory(&VaultInfo::ObjectStore(conf.clone()))?;
        Ok(ClientHolder {
            conf: Mutex::new(conf),
            client: RwLock::new(client),
            factory,
        })
    }

    pub fn reset(&self, conf: ObjectStoreConf) -> Result<()> {
        let client = (self.factory)(&VaultInfo::ObjectStore(conf.clone()))?;
        *self.conf.lock() = conf;
        *self.client.write() = client;
        Ok(())
    }

    pub fn conf(&self) -> ObjectStoreConf {
        self.conf.lock().clone()
    }

    fn client(&self) -> Arc<dyn ObjectClient> {
        self.client.read().clone()
    }
}

pub struct ObjectStoreFileSystem {
    id: String,
    holder: ClientHolder,
}

impl ObjectStoreFileSystem {
    pub fn new(id: impl Into<String>, conf: ObjectStoreConf, factory: ClientFactory) -> Result<Self> {
        Ok(ObjectStoreFileSystem { id: id.into(), holder: ClientHolder::new(conf, factory)? })
    }

    pub fn holder(&self) -> &ClientHolder {
        &self.holder
    }
}

pub struct HdfsFileSystem {
    id: String,
    conf: HdfsConf,
    client: Arc<dyn ObjectClient>,
}

impl HdfsFileSystem {
    pub fn new(id: impl Into<String>, conf: HdfsConf, factory: ClientFactory) -> Result<Self> {
        let client = factory(&VaultInfo::Hdfs(conf.clone()))?;
        Ok(HdfsFileSystem { id: id.into(), conf, client })
    }

    pub fn conf(&self) -> &HdfsConf {
        &self.conf
    }
}

/// Capability object for one storage vault. Dispatch is a tagged match so
/// each backend keeps its own refresh semantics.
pub enum VaultFileSystem {
    ObjectStore(ObjectStoreFileSystem),
    Hdfs(HdfsFileSystem),
}

impl VaultFileSystem {
    pub fn id(&self) -> &str {
        match self {
            VaultFileSystem::ObjectStore(fs) => &fs.id,
            VaultFileSystem::Hdfs(fs) => &fs.id,
        }
    }

    fn client(&self) -> Arc<dyn ObjectClient> {
        match self {
            VaultFileSystem::ObjectStore(fs) => fs.holder.client(),
            VaultFileSystem::Hdfs(fs) => fs.client.clone(),
        }
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.client().exists(path)
    }

    pub fn read(&self, path: &str) -> Result<Bytes> {
        self.client().read(path)
    }

    pub fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.client().write(path, data)
    }

    pub fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        self.client().append(path, data)
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        self.client().delete(path)
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.client().list(prefix)
    }
}

/// In-memory transport. The default client factory builds these, which keeps
/// a node bootable without remote storage and backs the unit tests.
#[derive(Default)]
pub struct InMemoryClient {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl InMemoryClient {
    pub fn factory() -> ClientFactory {
        Arc::new(|_info| Ok(Arc::new(InMemoryClient::default()) as Arc<dyn ObjectClient>))
    }
}

impl ObjectClient for InMemoryClient {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(path))
    }

    fn read(&self, path: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("object not found: {path}")))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.objects.write().insert(path.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut objects = self.objects.write();
        let mut buf = objects.get(path).map(|b| b.to_vec()).unwrap_or_default();
        buf.extend_from_slice(data);
        objects.insert(path.to_string(), Bytes::from(buf));
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_conf(key: &str) -> ObjectStoreConf {
        ObjectStoreConf {
            endpoint: "http://127.0.0.1:9000".to_string(),
            region: "local".to_string(),
            bucket: "b".to_string(),
            prefix: "p".to_string(),
            access_key: key.to_string(),
            secret_key: "secret".to_string(),
            role_arn: None,
            external_id: None,
        }
    }

    #[test]
    fn test_object_store_read_write() {
        let fs = VaultFileSystem::ObjectStore(
            ObjectStoreFileSystem::new("v1", object_conf("ak"), InMemoryClient::factory()).unwrap(),
        );
        assert!(!fs.exists("a/b").unwrap());
        fs.write("a/b", b"payload").unwrap();
        assert!(fs.exists("a/b").unwrap());
        fs.append("a/b", b"!").unwrap();
        assert_eq!(fs.read("a/b").unwrap().as_ref(), b"payload!");
        fs.delete("a/b").unwrap();
        assert!(!fs.exists("a/b").unwrap());
    }

    #[test]
    fn test_holder_reset_swaps_credentials() {
        let fs =
            ObjectStoreFileSystem::new("v2", object_conf("old"), InMemoryClient::factory()).unwrap();
        assert_eq!(fs.holder().conf().access_key, "old");
        fs.holder().reset(object_conf("new")).unwrap();
        assert_eq!(fs.holder().conf().access_key, "new");
    }

    #[test]
    fn test_path_format() {
        let flat = PathFormat::default();
        let id = RowsetId::generate();
        assert_eq!(flat.segment_path(5, &id, 0), format!("data/5/{id}_0.dat"));

        let sharded = PathFormat { path_version: 1, shard_num: 4 };
        assert_eq!(sharded.segment_path(6, &id, 1), format!("data/2/6/{id}/1.dat"));
    }
}
