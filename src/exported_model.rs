//! The exported model artifact and its assembler
//!
//! [`create_exported_model`] is the only way the pipeline builds an
//! [`ExportedModel`]. It takes the graph by value, checks the artifact's
//! invariants and hands the finished value back; nothing is retained.

use crate::error::{Error, Result};
use crate::graph::GraphDef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Checkpoint format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SaverVersion {
    /// Legacy single-file layout
    V1,
    /// Index plus data-file layout
    #[default]
    V2,
}

/// Save/restore description for externalized variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaverDef {
    /// Tensor the checkpoint prefix is fed into
    pub filename_tensor_name: String,
    /// Output tensor of the save operation
    pub save_tensor_name: String,
    /// Node that restores every variable when run
    pub restore_op_name: String,
    /// Variables covered by the checkpoint, in write order
    pub variable_names: Vec<String>,
    /// Checkpoint format
    pub version: SaverVersion,
}

/// Reference to an auxiliary file the model needs at load time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetFileDef {
    /// Tensor the asset path is fed into
    pub tensor_name: String,
    /// File name inside the assets directory
    pub filename: String,
}

/// The deployable artifact produced by one export call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedModel {
    /// Serializable computation graph
    pub graph: GraphDef,
    /// Node to run before anything else to initialize resources
    pub init_node_name: String,
    /// Where externalized variables were written, if any
    pub checkpoint_dir: Option<PathBuf>,
    /// Present only when variables were externalized
    pub saver_def: Option<SaverDef>,
    /// User-facing alias to function name in `graph`
    pub function_aliases: BTreeMap<String, String>,
    /// Asset references, in load order
    pub asset_file_defs: Vec<AssetFileDef>,
}

impl ExportedModel {
    /// Whether the model depends on an external checkpoint
    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint_dir.is_some()
    }

    /// Pretty JSON rendering of the artifact
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the artifact as JSON, via a temp file and rename
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let data = self.to_json_pretty()?;
        let temp_file = path.with_extension("json.tmp");
        fs::write(&temp_file, data)?;
        fs::rename(&temp_file, path)?;
        Ok(())
    }

    /// Read an artifact previously written with [`ExportedModel::save_json`]
    pub fn load_json(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Assemble an [`ExportedModel`] from parts extracted out of the transformed module
///
/// Fails with [`Error::MalformedExport`] when:
/// - `graph` has no nodes,
/// - `init_node_name` does not name a node in `graph`,
/// - a saver def is given without a non-empty checkpoint directory,
/// - a saver def names a tensor or op that is not a node of `graph`,
/// - an alias points at a function missing from `graph`.
///
/// An empty alias map is valid.
pub fn create_exported_model(
    graph: GraphDef,
    init_node_name: &str,
    checkpoint_dir: Option<&Path>,
    saver_def: Option<SaverDef>,
    function_aliases: &BTreeMap<String, String>,
    asset_file_defs: &[AssetFileDef],
) -> Result<ExportedModel> {
    if graph.is_empty() {
        return Err(Error::malformed_export("graph has no nodes"));
    }
    if !graph.has_node(init_node_name) {
        return Err(Error::malformed_export(format!(
            "init node `{}` not found in graph",
            init_node_name
        )));
    }

    let checkpoint_dir = checkpoint_dir
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf);
    if let Some(saver) = &saver_def {
        if checkpoint_dir.is_none() {
            return Err(Error::malformed_export(
                "saver def present without a checkpoint directory",
            ));
        }
        let unresolved = [
            &saver.filename_tensor_name,
            &saver.save_tensor_name,
            &saver.restore_op_name,
        ]
        .into_iter()
        .find(|name| !graph.has_tensor(name));
        if let Some(name) = unresolved {
            return Err(Error::malformed_export(format!(
                "saver def refers to `{}`, which is not in the graph",
                name
            )));
        }
    }

    if let Some((alias, target)) = function_aliases
        .iter()
        .find(|(_, target)| !graph.has_function(target))
    {
        return Err(Error::malformed_export(format!(
            "alias `{}` refers to missing function `{}`",
            alias, target
        )));
    }

    Ok(ExportedModel {
        graph,
        init_node_name: init_node_name.to_string(),
        checkpoint_dir,
        saver_def,
        function_aliases: function_aliases.clone(),
        asset_file_defs: asset_file_defs.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FunctionDef, NodeDef};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn node(name: &str, op: &str) -> NodeDef {
        NodeDef {
            name: name.to_string(),
            op: op.to_string(),
            input: Vec::new(),
            device: String::new(),
            attr: BTreeMap::new(),
        }
    }

    fn sample_graph() -> GraphDef {
        GraphDef {
            entry: "main".to_string(),
            node: vec![node("x", "Placeholder"), node("init_op", "NoOp")],
            library: vec![FunctionDef {
                name: "encode".to_string(),
                input_args: Vec::new(),
                output_args: Vec::new(),
                node_def: Vec::new(),
            }],
            ..Default::default()
        }
    }

    fn saver_graph() -> GraphDef {
        let mut graph = sample_graph();
        graph.node.extend([
            node("checkpoint_prefix", "Placeholder"),
            node("saver_output", "Identity"),
            node("restore_op", "NoOp"),
        ]);
        graph
    }

    fn saver() -> SaverDef {
        SaverDef {
            filename_tensor_name: "checkpoint_prefix:0".to_string(),
            save_tensor_name: "saver_output:0".to_string(),
            restore_op_name: "restore_op".to_string(),
            variable_names: vec!["w".to_string()],
            version: SaverVersion::V2,
        }
    }

    #[test]
    fn test_minimal_model() {
        let model =
            create_exported_model(sample_graph(), "init_op", None, None, &BTreeMap::new(), &[])
                .unwrap();
        assert_eq!(model.init_node_name, "init_op");
        assert!(model.function_aliases.is_empty());
        assert!(model.saver_def.is_none());
        assert!(!model.has_checkpoint());
    }

    #[test]
    fn test_empty_graph_rejected() {
        let err = create_exported_model(
            GraphDef::default(),
            "init_op",
            None,
            None,
            &BTreeMap::new(),
            &[],
        )
        .unwrap_err();
        assert!(err.is_malformed_export());
    }

    #[test]
    fn test_saver_def_requires_checkpoint_dir() {
        let err = create_exported_model(
            saver_graph(),
            "init_op",
            Some(Path::new("")),
            Some(saver()),
            &BTreeMap::new(),
            &[],
        )
        .unwrap_err();
        assert!(err.is_malformed_export());

        let model = create_exported_model(
            saver_graph(),
            "init_op",
            Some(Path::new("/ckpt")),
            Some(saver()),
            &BTreeMap::new(),
            &[],
        )
        .unwrap();
        assert_eq!(model.checkpoint_dir.as_deref(), Some(Path::new("/ckpt")));
    }

    #[test]
    fn test_saver_names_must_resolve() {
        let err = create_exported_model(
            sample_graph(),
            "init_op",
            Some(Path::new("/ckpt")),
            Some(saver()),
            &BTreeMap::new(),
            &[],
        )
        .unwrap_err();
        assert!(err.is_malformed_export());
        assert!(err.to_string().contains("checkpoint_prefix:0"));

        let mut graph = saver_graph();
        graph.node.retain(|n| n.name != "restore_op");
        let err = create_exported_model(
            graph,
            "init_op",
            Some(Path::new("/ckpt")),
            Some(saver()),
            &BTreeMap::new(),
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("restore_op"));
    }

    #[test]
    fn test_aliases_must_resolve() {
        let mut aliases = BTreeMap::new();
        aliases.insert("serve".to_string(), "main".to_string());
        aliases.insert("embed".to_string(), "encode".to_string());
        assert!(
            create_exported_model(sample_graph(), "init_op", None, None, &aliases, &[]).is_ok()
        );

        aliases.insert("stale".to_string(), "renamed_away".to_string());
        let err = create_exported_model(sample_graph(), "init_op", None, None, &aliases, &[])
            .unwrap_err();
        assert!(err.to_string().contains("renamed_away"));
    }

    #[test]
    fn test_asset_order_preserved_and_json_persisted() {
        let assets = vec![
            AssetFileDef {
                tensor_name: "vocab:0".to_string(),
                filename: "vocab.txt".to_string(),
            },
            AssetFileDef {
                tensor_name: "labels:0".to_string(),
                filename: "labels.txt".to_string(),
            },
        ];
        let model =
            create_exported_model(sample_graph(), "init_op", None, None, &BTreeMap::new(), &assets)
                .unwrap();
        assert_eq!(model.asset_file_defs, assets);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exported_model.json");
        model.save_json(&path).unwrap();
        assert!(!dir.path().join("exported_model.json.tmp").exists());
        assert_eq!(ExportedModel::load_json(&path).unwrap(), model);
    }

    proptest! {
        #[test]
        fn prop_unknown_init_node_rejected(name in "[a-z_]{1,12}") {
            prop_assume!(name != "x" && name != "init_op");
            let result = create_exported_model(
                sample_graph(),
                &name,
                None,
                None,
                &BTreeMap::new(),
                &[],
            );
            prop_assert!(result.unwrap_err().is_malformed_export());
        }
    }
}
