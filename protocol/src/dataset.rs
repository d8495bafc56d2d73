use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// One column of a dataset file's schema, as recorded by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub column: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

/// A single file belonging to a dataset. `path` is the on-disk path as known
/// to the registry; executors are responsible for re-rooting it under
/// `/data` inside the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetFile {
    pub name: String,
    pub path: PathBuf,
    pub schema: Vec<SchemaColumn>,
}

/// Immutable description of a named dataset, owned by the registry and
/// consumed read-only by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: String,
    pub name: String,
    pub files: Vec<DatasetFile>,
    pub version_hash: String,
    #[serde(default)]
    pub example_prompts: Vec<String>,
}

impl DatasetDescriptor {
    /// Find a file's schema by its SQL table name (the file's `name`).
    pub fn file(&self, table: &str) -> Option<&DatasetFile> {
        self.files.iter().find(|f| f.name == table)
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.file(table)
            .is_some_and(|f| f.schema.iter().any(|c| c.column == column))
    }
}
