//! Classifier artifacts produced by training.
//!
//! Each model `N` has an artifact named `model-N` under `[scoring] model_dir`,
//! in one of two encodings:
//!
//! ```text
//! model-N/               portable bundle (canonical)
//!   model.json           { "format_version": 1, "kind": "logistic_regression" | "boosted_trees", ... }
//!   scaler.json          { "mean": [...], "scale": [...], "var": [...], "n_features_in": D }
//!
//! model-N                single combined JSON file (read-only fallback)
//!                        { "model": <model.json body>, "scaler": <scaler.json body> }
//! ```
//!
//! When both exist the bundle wins. `boosted_trees` uses the XGBoost JSON
//! dump node format (`nodeid`, `split: "f12"`, `split_condition`, `yes`,
//! `no`, `missing`, `children`, `leaf`).

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::Model;

/// Highest `format_version` this build can read.
pub const SUPPORTED_FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("no classifier artifact for model {model_id} in {}", .dir.display())]
    NotFound { model_id: i64, dir: PathBuf },
    #[error("unsupported artifact format_version {found} (max {max})", max = SUPPORTED_FORMAT_VERSION)]
    UnsupportedVersion { found: u32 },
    #[error("invalid artifact {}: {message}", .path.display())]
    Invalid { path: PathBuf, message: String },
    #[error("expected {expected} features, got {got}")]
    FeatureMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Which on-disk encoding an artifact was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactEncoding {
    /// `model-N/` directory with `model.json` and `scaler.json`.
    Bundle,
    /// One JSON document holding both under `model` and `scaler` keys.
    SingleFile,
}

// ═══════════════════════════════════════════════════════════════════════
// Scaler
// ═══════════════════════════════════════════════════════════════════════

/// Standardization parameters (`(x - mean) / scale`).
#[derive(Debug, Clone, Deserialize)]
pub struct StandardScaler {
    #[serde(default)]
    pub mean: Option<Vec<f64>>,
    #[serde(default)]
    pub scale: Option<Vec<f64>>,
    #[serde(default)]
    pub var: Option<Vec<f64>>,
    pub n_features_in: usize,
}

impl StandardScaler {
    fn validate(&mut self) -> Result<(), String> {
        let n = self.n_features_in;
        if self.scale.is_none() {
            self.scale = self
                .var
                .as_ref()
                .map(|var| var.iter().map(|v| v.sqrt()).collect());
        }
        for (name, values) in [("mean", &self.mean), ("scale", &self.scale)] {
            if let Some(values) = values {
                if values.len() != n {
                    return Err(format!("scaler.{} has {} entries, expected {}", name, values.len(), n));
                }
            }
        }
        Ok(())
    }

    pub fn transform(&self, features: &[f32]) -> Result<Vec<f64>, ArtifactError> {
        if features.len() != self.n_features_in {
            return Err(ArtifactError::FeatureMismatch {
                expected: self.n_features_in,
                got: features.len(),
            });
        }

        Ok(features
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let mut value = f64::from(x);
                if let Some(mean) = &self.mean {
                    value -= mean[i];
                }
                if let Some(scale) = &self.scale {
                    // Constant features were fit with scale 0; leave them unscaled.
                    if scale[i] != 0.0 {
                        value /= scale[i];
                    }
                }
                value
            })
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Classifiers
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ClassifierDump {
    LogisticRegression {
        coef: Vec<f64>,
        #[serde(default)]
        intercept: f64,
    },
    BoostedTrees {
        #[serde(default = "default_base_score")]
        base_score: f64,
        #[serde(default = "default_objective")]
        objective: String,
        trees: Vec<RawNode>,
    },
}

fn default_base_score() -> f64 {
    0.5
}
fn default_objective() -> String {
    "binary:logistic".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawNode {
    Split {
        nodeid: u32,
        split: String,
        split_condition: f64,
        yes: u32,
        no: u32,
        #[serde(default)]
        missing: Option<u32>,
        children: Vec<RawNode>,
    },
    Leaf {
        nodeid: u32,
        leaf: f64,
    },
}

impl RawNode {
    fn nodeid(&self) -> u32 {
        match self {
            RawNode::Split { nodeid, .. } | RawNode::Leaf { nodeid, .. } => *nodeid,
        }
    }
}

/// A compiled regression tree.
#[derive(Debug, Clone)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        yes: Box<TreeNode>,
        no: Box<TreeNode>,
        missing_goes_yes: bool,
    },
    Leaf(f64),
}

impl TreeNode {
    fn compile(raw: &RawNode) -> Result<Self, String> {
        match raw {
            RawNode::Leaf { leaf, .. } => Ok(TreeNode::Leaf(*leaf)),
            RawNode::Split {
                nodeid,
                split,
                split_condition,
                yes,
                no,
                missing,
                children,
            } => {
                let feature = split
                    .strip_prefix('f')
                    .unwrap_or(split)
                    .parse::<usize>()
                    .map_err(|_| format!("node {}: unrecognized split feature '{}'", nodeid, split))?;
                let by_id: HashMap<u32, &RawNode> =
                    children.iter().map(|child| (child.nodeid(), child)).collect();
                let child = |id: u32| {
                    by_id
                        .get(&id)
                        .ok_or_else(|| format!("node {}: missing child {}", nodeid, id))
                        .and_then(|node| TreeNode::compile(node))
                };

                Ok(TreeNode::Split {
                    feature,
                    threshold: *split_condition,
                    yes: Box::new(child(*yes)?),
                    no: Box::new(child(*no)?),
                    missing_goes_yes: missing.map_or(true, |m| m == *yes),
                })
            }
        }
    }

    fn max_feature(&self) -> Option<usize> {
        match self {
            TreeNode::Leaf(_) => None,
            TreeNode::Split { feature, yes, no, .. } => [Some(*feature), yes.max_feature(), no.max_feature()]
                .into_iter()
                .flatten()
                .max(),
        }
    }

    fn evaluate(&self, features: &[f64]) -> f64 {
        let mut node = self;
        loop {
            match node {
                TreeNode::Leaf(value) => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    yes,
                    no,
                    missing_goes_yes,
                } => {
                    let value = features.get(*feature).copied().unwrap_or(f64::NAN);
                    let go_yes = if value.is_nan() {
                        *missing_goes_yes
                    } else {
                        value < *threshold
                    };
                    node = if go_yes { yes.as_ref() } else { no.as_ref() };
                }
            }
        }
    }
}

/// A loaded, ready-to-run classifier.
#[derive(Debug, Clone)]
pub enum Classifier {
    LogisticRegression { coef: Vec<f64>, intercept: f64 },
    BoostedTrees {
        base_margin: f64,
        logistic: bool,
        trees: Vec<TreeNode>,
    },
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl Classifier {
    fn from_dump(dump: ClassifierDump) -> Result<Self, String> {
        match dump {
            ClassifierDump::LogisticRegression { coef, intercept } => {
                if coef.is_empty() {
                    return Err("logistic_regression.coef is empty".to_string());
                }
                Ok(Classifier::LogisticRegression { coef, intercept })
            }
            ClassifierDump::BoostedTrees {
                base_score,
                objective,
                trees,
            } => {
                let logistic = objective.ends_with(":logistic");
                let base_margin = if logistic {
                    if !(base_score > 0.0 && base_score < 1.0) {
                        return Err(format!("base_score {} outside (0, 1)", base_score));
                    }
                    (base_score / (1.0 - base_score)).ln()
                } else {
                    base_score
                };
                let trees = trees
                    .iter()
                    .map(TreeNode::compile)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Classifier::BoostedTrees {
                    base_margin,
                    logistic,
                    trees,
                })
            }
        }
    }

    /// Minimum feature count the classifier reads.
    fn required_features(&self) -> usize {
        match self {
            Classifier::LogisticRegression { coef, .. } => coef.len(),
            Classifier::BoostedTrees { trees, .. } => trees
                .iter()
                .filter_map(TreeNode::max_feature)
                .max()
                .map_or(0, |max| max + 1),
        }
    }

    /// Positive-class score for one scaled feature vector.
    pub fn predict(&self, features: &[f64]) -> f64 {
        match self {
            Classifier::LogisticRegression { coef, intercept } => {
                let dot: f64 = coef.iter().zip(features).map(|(w, x)| w * x).sum();
                sigmoid(dot + intercept)
            }
            Classifier::BoostedTrees {
                base_margin,
                logistic,
                trees,
            } => {
                let margin = base_margin + trees.iter().map(|t| t.evaluate(features)).sum::<f64>();
                if *logistic {
                    sigmoid(margin)
                } else {
                    margin
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Artifact loading
// ═══════════════════════════════════════════════════════════════════════

/// A classifier paired with the scaler it was trained behind.
#[derive(Debug, Clone)]
pub struct ClassifierArtifact {
    pub classifier: Classifier,
    pub scaler: StandardScaler,
    pub encoding: ArtifactEncoding,
}

impl ClassifierArtifact {
    /// Scale raw embedding features and run inference.
    pub fn score(&self, embedding: &[f32]) -> Result<f64, ArtifactError> {
        let scaled = self.scaler.transform(embedding)?;
        Ok(self.classifier.predict(&scaled))
    }

    fn assemble(
        path: &Path,
        model: Value,
        scaler: Value,
        encoding: ArtifactEncoding,
    ) -> Result<Self, ArtifactError> {
        let invalid = |message: String| ArtifactError::Invalid {
            path: path.to_path_buf(),
            message,
        };

        let version = model
            .get("format_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid("model is missing format_version".to_string()))?;
        let version = u32::try_from(version).unwrap_or(u32::MAX);
        if version == 0 || version > SUPPORTED_FORMAT_VERSION {
            return Err(ArtifactError::UnsupportedVersion { found: version });
        }

        let dump: ClassifierDump =
            serde_json::from_value(model).map_err(|e| invalid(format!("model: {}", e)))?;
        let classifier = Classifier::from_dump(dump).map_err(invalid)?;

        let mut scaler: StandardScaler =
            serde_json::from_value(scaler).map_err(|e| invalid(format!("scaler: {}", e)))?;
        scaler.validate().map_err(invalid)?;

        let required = classifier.required_features();
        if required > scaler.n_features_in {
            return Err(invalid(format!(
                "classifier reads {} features but scaler provides {}",
                required, scaler.n_features_in
            )));
        }

        Ok(Self {
            classifier,
            scaler,
            encoding,
        })
    }
}

fn read_json(path: &Path) -> Result<Value, ArtifactError> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| ArtifactError::Invalid {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load the artifact for `model_id`, auto-detecting its encoding.
pub fn load_artifact(model_dir: &Path, model_id: i64) -> Result<ClassifierArtifact, ArtifactError> {
    let base = model_dir.join(Model::artifact_name(model_id));

    if base.is_dir() {
        let model_path = base.join("model.json");
        let scaler_path = base.join("scaler.json");
        if model_path.is_file() && scaler_path.is_file() {
            let model = read_json(&model_path)?;
            let scaler = read_json(&scaler_path)?;
            return ClassifierArtifact::assemble(&base, model, scaler, ArtifactEncoding::Bundle);
        }
    }

    for single in [base.clone(), base.with_extension("json")] {
        if single.is_file() {
            let mut combined = read_json(&single)?;
            let (Some(model), Some(scaler)) = (
                combined.get_mut("model").map(Value::take),
                combined.get_mut("scaler").map(Value::take),
            ) else {
                return Err(ArtifactError::Invalid {
                    path: single,
                    message: "expected top-level \"model\" and \"scaler\" keys".to_string(),
                });
            };
            return ClassifierArtifact::assemble(&single, model, scaler, ArtifactEncoding::SingleFile);
        }
    }

    Err(ArtifactError::NotFound {
        model_id,
        dir: model_dir.to_path_buf(),
    })
}
