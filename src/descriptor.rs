use anyhow::{bail, Context, Result};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;

use crate::crypto::{SpaceHeader, SpaceKey};
use crate::types::{PeerId, SpaceId};

/// Access-control payload: who may write and the shared read key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclPayload {
    pub members: Vec<PeerId>,
    pub read_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceSettings {
    pub metadata: String,
    pub operations_prefix: String,
}

/// Everything a replica needs to open a space it did not create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceDescriptor {
    pub id: SpaceId,
    pub header: SpaceHeader,
    pub acl: AclPayload,
    pub settings: SpaceSettings,
}

impl SpaceDescriptor {
    pub fn new(header: SpaceHeader, key: &SpaceKey, settings: SpaceSettings) -> Result<Self> {
        Ok(Self {
            id: header.derive_id()?,
            acl: AclPayload {
                members: vec![header.creator.clone()],
                read_key: key.encode(),
            },
            header,
            settings,
        })
    }

    /// The id must be the hash of the header it travels with.
    pub fn verify(&self) -> Result<()> {
        let derived = self.header.derive_id()?;
        if derived != self.id {
            bail!(
                "descriptor id {} does not match header hash {derived}",
                self.id
            );
        }
        Ok(())
    }

    pub fn read_key(&self) -> Result<SpaceKey> {
        SpaceKey::decode(&self.acl.read_key)
    }

    const FILE_NAME: &'static str = "descriptor.json";

    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let tmp = dir.join("descriptor.json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, dir.join(Self::FILE_NAME))?;
        Ok(())
    }

    /// `Ok(None)` when `dir` holds no descriptor
    pub fn load_from(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(Self::FILE_NAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let descriptor: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt descriptor at {}", path.display()))?;
        descriptor.verify()?;
        Ok(Some(descriptor))
    }
}
