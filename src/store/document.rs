use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::store::record::Artifacts;

/// Job input document: an ordered list of chain entries plus whatever else
/// the model expects (`name`, `modelSeeds`, `dialect`, ...), kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDocument {
    #[serde(default)]
    pub sequences: Vec<ChainEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry of `sequences`. Only protein entries carry cacheable
/// artifacts; ligands, nucleic acids and the like pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein: Option<ProteinChain>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProteinChain {
    /// A chain letter or a list of them.
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub sequence: String,
    #[serde(rename = "unpairedMsa", default, skip_serializing_if = "Option::is_none")]
    pub unpaired_msa: Option<String>,
    #[serde(rename = "pairedMsa", default, skip_serializing_if = "Option::is_none")]
    pub paired_msa: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProteinChain {
    pub fn new(id: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self {
            id: Value::String(id.into()),
            sequence: sequence.into(),
            unpaired_msa: None,
            paired_msa: None,
            templates: None,
            extra: Map::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Artifacts) -> Self {
        self.set_artifacts(artifacts);
        self
    }

    /// Chain id for log messages.
    pub fn label(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            Value::Null => "?".to_string(),
            other => other.to_string(),
        }
    }

    pub fn artifacts(&self) -> Artifacts {
        Artifacts {
            unpaired_msa: self.unpaired_msa.clone(),
            paired_msa: self.paired_msa.clone(),
            templates: self.templates.clone(),
        }
    }

    pub fn set_artifacts(&mut self, artifacts: Artifacts) {
        self.unpaired_msa = artifacts.unpaired_msa;
        self.paired_msa = artifacts.paired_msa;
        self.templates = artifacts.templates;
    }
}

impl ChainEntry {
    pub fn protein(chain: ProteinChain) -> Self {
        Self {
            protein: Some(chain),
            other: Map::new(),
        }
    }
}

impl BatchDocument {
    pub fn new(sequences: Vec<ChainEntry>) -> Self {
        Self {
            sequences,
            extra: Map::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn proteins(&self) -> impl Iterator<Item = &ProteinChain> {
        self.sequences.iter().filter_map(|e| e.protein.as_ref())
    }
}
