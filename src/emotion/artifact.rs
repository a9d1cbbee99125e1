//! Versioned on-disk format of the emotion model.
//!
//! ```json
//! { "format_version": 1,
//!   "labels": ["normal_angry", "strong_angry", ...],
//!   "feature_columns": ["mfcc_mean_1", "mfcc_std_1", ...],
//!   "classifier": { "kind": "random_forest", "trees": [{ "nodes": [...] }] } }
//! ```
//!
//! The training side exports this document; the service only reads it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

pub const FORMAT_VERSION: u32 = 1;

/// The whole artifact as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    /// Class index → `"<intensity>_<emotion>"`
    pub labels: Vec<String>,
    /// Feature names in the order the classifier consumes them
    pub feature_columns: Vec<String>,
    pub classifier: ClassifierSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierSpec {
    RandomForest { trees: Vec<DecisionTree> },
    LogisticRegression { coefficients: Vec<Vec<f64>>, intercepts: Vec<f64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

/// One node; a leaf has `left < 0`.
///
/// Internal nodes send `x[feature] <= threshold` left. `value` holds per-class
/// counts (or fractions) and is only read at leaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub feature: i64,
    pub threshold: f64,
    pub left: i64,
    pub right: i64,
    #[serde(default)]
    pub value: Vec<f64>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.left < 0
    }
}

impl ModelArtifact {
    /// Read and structurally validate an artifact file.
    pub fn from_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::ModelLoad(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> AppResult<Self> {
        let artifact: ModelArtifact = serde_json::from_str(text)
            .map_err(|e| AppError::ModelLoad(format!("Malformed model artifact: {}", e)))?;
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn n_classes(&self) -> usize {
        self.labels.len()
    }

    /// Structural checks that do not depend on the extractor.
    pub fn validate(&self) -> AppResult<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(AppError::ModelLoad(format!(
                "Unsupported artifact format version {} (expected {})",
                self.format_version, FORMAT_VERSION
            )));
        }
        if self.labels.is_empty() {
            return Err(AppError::ModelLoad("Artifact has no labels".to_string()));
        }
        if let Some(bad) = self.labels.iter().find(|l| !l.contains('_')) {
            return Err(AppError::ModelLoad(format!(
                "Label '{}' is not of the form <intensity>_<emotion>",
                bad
            )));
        }
        if self.feature_columns.is_empty() {
            return Err(AppError::ModelLoad("Artifact has no feature columns".to_string()));
        }

        let n_classes = self.labels.len();
        let n_features = self.feature_columns.len();

        match &self.classifier {
            ClassifierSpec::RandomForest { trees } => {
                if trees.is_empty() {
                    return Err(AppError::ModelLoad("Random forest has no trees".to_string()));
                }
                for (t, tree) in trees.iter().enumerate() {
                    validate_tree(tree, n_classes, n_features)
                        .map_err(|msg| AppError::ModelLoad(format!("Tree {}: {}", t, msg)))?;
                }
            }
            ClassifierSpec::LogisticRegression { coefficients, intercepts } => {
                if coefficients.len() != n_classes || intercepts.len() != n_classes {
                    return Err(AppError::ModelLoad(format!(
                        "Logistic regression has {} coefficient rows and {} intercepts for {} labels",
                        coefficients.len(),
                        intercepts.len(),
                        n_classes
                    )));
                }
                if let Some(row) = coefficients.iter().position(|r| r.len() != n_features) {
                    return Err(AppError::ModelLoad(format!(
                        "Coefficient row {} does not have {} entries",
                        row, n_features
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Children must point forward, which also rules out cycles.
fn validate_tree(tree: &DecisionTree, n_classes: usize, n_features: usize) -> Result<(), String> {
    if tree.nodes.is_empty() {
        return Err("no nodes".to_string());
    }
    let n = tree.nodes.len() as i64;
    for (i, node) in tree.nodes.iter().enumerate() {
        let i = i as i64;
        if node.is_leaf() {
            if node.value.len() != n_classes {
                return Err(format!(
                    "leaf {} has {} class values, expected {}",
                    i,
                    node.value.len(),
                    n_classes
                ));
            }
            if node.value.iter().any(|v| *v < 0.0) || node.value.iter().sum::<f64>() <= 0.0 {
                return Err(format!("leaf {} has no positive class mass", i));
            }
        } else {
            if node.left <= i || node.left >= n || node.right <= i || node.right >= n {
                return Err(format!("node {} has out-of-range children {}/{}", i, node.left, node.right));
            }
            if node.feature < 0 || node.feature as usize >= n_features {
                return Err(format!("node {} splits on unknown feature {}", i, node.feature));
            }
        }
    }
    Ok(())
}
