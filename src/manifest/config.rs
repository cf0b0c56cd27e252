//! The container configuration JSON (§4.4): `architecture, os,
//! config{Env, Entrypoint, Cmd, ExposedPorts, Volumes, Labels, WorkingDir,
//! User}, rootfs{type:"layers", diff_ids:[]}, history[]`.

use crate::digest::Digest;
use crate::model::image::Image;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigDetails {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env_map: BTreeMap<String, String>,
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "ExposedPorts", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "Volumes", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<Digest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HistoryEntry {
    pub created: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "empty_layer")]
    pub empty_layer: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub architecture: String,
    pub os: String,
    pub config: ConfigDetails,
    pub rootfs: RootFs,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub created: String,
}

impl ContainerConfig {
    /// Builds the config JSON from a fully resolved [`Image`] and its final
    /// diff-ids, in layer order (§3 invariant: `layers[i].diff_id ==
    /// rootfs.diff_ids[i]`).
    pub fn from_image(image: &Image, diff_ids: Vec<Digest>) -> Self {
        let created = chrono::DateTime::<chrono::Utc>::from(image.created).to_rfc3339();
        let history = diff_ids
            .iter()
            .enumerate()
            .map(|(i, _)| HistoryEntry {
                created: created.clone(),
                created_by: image.history.get(i).cloned(),
                empty_layer: None,
            })
            .collect();

        ContainerConfig {
            architecture: image.platform.architecture.clone(),
            os: image.platform.os.clone(),
            config: ConfigDetails {
                env_map: Default::default(),
                env: image.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
                entrypoint: image.entrypoint.clone(),
                cmd: image.cmd.clone(),
                exposed_ports: image.exposed_ports.iter().map(|p| (p.clone(), serde_json::json!({}))).collect(),
                volumes: image.volumes.iter().map(|v| (v.clone(), serde_json::json!({}))).collect(),
                labels: image.labels.clone(),
                working_dir: image.working_dir.clone().unwrap_or_default(),
                user: image.user.clone().unwrap_or_default(),
            },
            rootfs: RootFs { fs_type: "layers".to_string(), diff_ids },
            history,
            created,
        }
    }

    pub fn to_json_bytes(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageLayers, Platform};
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::SystemTime;

    fn sample_image() -> Image {
        Image {
            layers: ImageLayers::new(),
            history: vec!["build app layer".to_string()],
            env: BTreeMap::from([("PATH".to_string(), "/usr/bin".to_string())]),
            entrypoint: Some(vec!["/app/run".to_string()]),
            cmd: None,
            labels: BTreeMap::new(),
            exposed_ports: BTreeSet::from(["8080/tcp".to_string()]),
            volumes: BTreeSet::new(),
            user: Some("1000".to_string()),
            working_dir: Some("/app".to_string()),
            created: SystemTime::UNIX_EPOCH,
            platform: Platform::default(),
        }
    }

    #[test]
    fn diff_ids_preserve_order() {
        let image = sample_image();
        let ids = vec![Digest::from_hex(&"1".repeat(64)).unwrap(), Digest::from_hex(&"2".repeat(64)).unwrap()];
        let config = ContainerConfig::from_image(&image, ids.clone());
        assert_eq!(config.rootfs.diff_ids, ids);
    }

    #[test]
    fn env_is_formatted_as_key_value_pairs() {
        let image = sample_image();
        let config = ContainerConfig::from_image(&image, vec![]);
        assert_eq!(config.config.env, vec!["PATH=/usr/bin".to_string()]);
    }
}
