use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tabulon_protocol::DatasetDescriptor;

use crate::error::GatewayErr;
use crate::error::Result;

#[derive(Debug, Deserialize)]
struct RegistryFile {
    datasets: Vec<DatasetDescriptor>,
}

/// Read-only, load-once view of the datasets this server knows about.
///
/// Dataset file generation and on-disk layout are external collaborators;
/// this type only consumes the descriptor file they produce.
#[derive(Debug, Clone)]
pub struct DatasetRegistry {
    by_id: HashMap<String, DatasetDescriptor>,
}

impl DatasetRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: RegistryFile = serde_json::from_str(&raw)?;
        let by_id = parsed
            .datasets
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        Ok(Self { by_id })
    }

    pub fn from_descriptors(descriptors: Vec<DatasetDescriptor>) -> Self {
        Self {
            by_id: descriptors.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    pub fn get(&self, dataset_id: &str) -> Result<&DatasetDescriptor> {
        self.by_id
            .get(dataset_id)
            .ok_or_else(|| GatewayErr::DatasetNotFound(dataset_id.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &DatasetDescriptor> {
        self.by_id.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabulon_protocol::DatasetFile;
    use tabulon_protocol::SchemaColumn;

    fn sample() -> DatasetDescriptor {
        DatasetDescriptor {
            id: "support".into(),
            name: "Support tickets".into(),
            files: vec![DatasetFile {
                name: "tickets".into(),
                path: "/data/tickets.csv".into(),
                schema: vec![SchemaColumn {
                    column: "id".into(),
                    data_type: "integer".into(),
                }],
            }],
            version_hash: "abc123".into(),
            example_prompts: vec!["how many tickets are open?".into()],
        }
    }

    #[test]
    fn get_known_dataset() {
        let reg = DatasetRegistry::from_descriptors(vec![sample()]);
        assert_eq!(reg.get("support").unwrap().name, "Support tickets");
    }

    #[test]
    fn get_unknown_dataset_errors() {
        let reg = DatasetRegistry::from_descriptors(vec![sample()]);
        let err = reg.get("nope").unwrap_err();
        assert_eq!(err.kind(), tabulon_protocol::ErrorKind::ValidationError);
    }
}
