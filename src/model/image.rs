//! The fully-resolved [`Image`] value the assembler (C10) turns into a
//! manifest + container config. Immutable once constructed; passed by value
//! to target writers.

use crate::model::layer::ImageLayers;
use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Default for Platform {
    fn default() -> Self {
        Platform { architecture: "amd64".to_string(), os: "linux".to_string() }
    }
}

pub struct Image {
    pub layers: ImageLayers,
    /// One entry per layer, in the same order, describing how it was built.
    pub history: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub labels: BTreeMap<String, String>,
    /// `"<port>/<proto>"`, e.g. `"8080/tcp"`.
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub created: SystemTime,
    pub platform: Platform,
}

impl Image {
    pub fn invariant_diff_ids_match(&self, config_diff_ids: &[crate::digest::Digest]) -> bool {
        if self.layers.len() != config_diff_ids.len() {
            return false;
        }
        self.layers
            .iter()
            .zip(config_diff_ids.iter())
            .all(|(layer, expected)| layer.diff_id() == Some(expected))
    }
}
