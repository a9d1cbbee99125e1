use std::path::Path;

use serde::Serialize;
use tracing::{debug, info};

use super::artifact::{ClassifierSpec, DecisionTree, ModelArtifact};
use crate::features::{FeatureSchema, FeatureVector};
use crate::error::{AppError, AppResult};

/// Classifier output for one recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmotionPrediction {
    /// `"<intensity>_<emotion>"`
    pub label: String,
    /// One entry per artifact label, summing to 1
    pub probabilities: Vec<f64>,
    /// Severity contribution in [1, 5]
    pub score: f64,
}

/// A loaded emotion model whose columns are known to match the extractor.
#[derive(Debug, Clone)]
pub struct EmotionModel {
    artifact: ModelArtifact,
}

impl EmotionModel {
    /// Load an artifact and check it against the extractor's schema.
    ///
    /// Any disagreement in column names or order is fatal: the caller refuses to
    /// serve predictions rather than guess an order.
    pub fn load(path: impl AsRef<Path>, schema: &FeatureSchema) -> AppResult<Self> {
        let artifact = ModelArtifact::from_path(path.as_ref())?;
        let model = Self::from_artifact(artifact, schema)
            .map_err(|e| AppError::ModelLoad(format!("{}: {}", path.as_ref().display(), e)))?;
        info!(
            "Emotion model loaded from {} ({} classes, {} features)",
            path.as_ref().display(),
            model.labels().len(),
            model.feature_columns().len()
        );
        Ok(model)
    }

    /// Wrap an already-parsed artifact; returns a schema error on column mismatch.
    pub fn from_artifact(artifact: ModelArtifact, schema: &FeatureSchema) -> AppResult<Self> {
        artifact.validate()?;
        schema.check(&artifact.feature_columns)?;
        Ok(Self { artifact })
    }

    pub fn labels(&self) -> &[String] {
        &self.artifact.labels
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.artifact.feature_columns
    }

    pub fn format_version(&self) -> u32 {
        self.artifact.format_version
    }

    pub fn kind(&self) -> &'static str {
        match self.artifact.classifier {
            ClassifierSpec::RandomForest { .. } => "random_forest",
            ClassifierSpec::LogisticRegression { .. } => "logistic_regression",
        }
    }

    /// Classify a feature vector.
    pub fn classify(&self, features: &FeatureVector) -> AppResult<EmotionPrediction> {
        let x = features.select(&self.artifact.feature_columns)?;
        let probabilities = self.predict_proba(&x);

        let best = probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .ok_or_else(|| AppError::Internal("Classifier produced no probabilities".to_string()))?;
        let label = self.artifact.labels[best].clone();
        let score = emotion_to_score(&label);

        debug!("Emotion prediction: {} (p={:.3}, score {})", label, probabilities[best], score);

        Ok(EmotionPrediction {
            label,
            probabilities,
            score,
        })
    }

    fn predict_proba(&self, x: &[f64]) -> Vec<f64> {
        let n_classes = self.artifact.n_classes();
        match &self.artifact.classifier {
            ClassifierSpec::RandomForest { trees } => {
                let mut acc = vec![0.0; n_classes];
                for tree in trees {
                    let leaf = leaf_distribution(tree, x);
                    let total: f64 = leaf.iter().sum();
                    for (a, v) in acc.iter_mut().zip(leaf) {
                        *a += v / total;
                    }
                }
                acc.iter().map(|a| a / trees.len() as f64).collect()
            }
            ClassifierSpec::LogisticRegression { coefficients, intercepts } => {
                let logits: Vec<f64> = coefficients
                    .iter()
                    .zip(intercepts)
                    .map(|(row, b)| row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + b)
                    .collect();
                softmax(&logits)
            }
        }
    }
}

/// Walk a validated tree down to its leaf.
fn leaf_distribution<'a>(tree: &'a DecisionTree, x: &[f64]) -> &'a [f64] {
    let mut idx = 0usize;
    loop {
        let node = &tree.nodes[idx];
        if node.is_leaf() {
            return &node.value;
        }
        idx = if x[node.feature as usize] <= node.threshold {
            node.left as usize
        } else {
            node.right as usize
        };
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Base severity of an emotion before the intensity factor.
fn base_severity(emotion: &str) -> f64 {
    match emotion {
        "neutral" => 1.0,
        "calm" => 1.2,
        "happy" => 1.5,
        "surprised" => 2.0,
        "sad" => 3.5,
        "fearful" => 4.0,
        "angry" => 4.5,
        "disgust" => 4.7,
        _ => 3.0,
    }
}

/// Map `"<intensity>_<emotion>"` to a severity contribution in [1, 5].
///
/// `normal` intensity keeps the base value; any other intensity scales it by 1.2.
/// A label without an intensity prefix is treated as `normal`.
pub fn emotion_to_score(label: &str) -> f64 {
    let (intensity, emotion) = label.split_once('_').unwrap_or(("normal", label));
    let multiplier = if intensity == "normal" { 1.0 } else { 1.2 };
    let score = (base_severity(emotion) * multiplier).clamp(1.0, 5.0);
    (score * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ConditionedSignal;
    use crate::config::AppConfig;
    use crate::emotion::artifact::tests::stump_artifact;
    use crate::features::FeatureExtractor;

    #[test]
    fn test_emotion_to_score_table() {
        assert_eq!(emotion_to_score("normal_neutral"), 1.0);
        assert_eq!(emotion_to_score("normal_calm"), 1.2);
        assert_eq!(emotion_to_score("strong_calm"), 1.44);
        assert_eq!(emotion_to_score("strong_sad"), 4.2);
        assert_eq!(emotion_to_score("strong_angry"), 5.0);
        assert_eq!(emotion_to_score("strong_disgust"), 5.0);
        assert_eq!(emotion_to_score("normal_bored"), 3.0);
        assert_eq!(emotion_to_score("strong_bored"), 3.6);
        assert_eq!(emotion_to_score("fearful"), 4.0);
    }

    #[test]
    fn test_schema_mismatch_is_rejected() {
        let extractor = FeatureExtractor::new(AppConfig::default().features);
        let mut columns = extractor.schema().names().to_vec();
        columns.swap(2, 3);
        let err = EmotionModel::from_artifact(stump_artifact(columns, 0, 0.0), extractor.schema()).unwrap_err();
        assert_eq!(err.kind(), "schema_error");
    }

    #[test]
    fn test_load_reports_schema_mismatch_as_model_load() {
        let extractor = FeatureExtractor::new(AppConfig::default().features);
        let artifact = stump_artifact(vec!["rms_mean".into()], 0, 0.0);
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_string(&artifact).unwrap()).unwrap();

        let err = EmotionModel::load(file.path(), extractor.schema()).unwrap_err();
        assert_eq!(err.kind(), "model_load_error");
    }

    #[test]
    fn test_forest_prediction_on_extracted_features() {
        let extractor = FeatureExtractor::new(AppConfig::default().features);
        let columns = extractor.schema().names().to_vec();
        let rms_max = columns.iter().position(|c| c == "rms_max").unwrap();
        let model = EmotionModel::from_artifact(stump_artifact(columns, rms_max, 0.2), extractor.schema()).unwrap();

        let loud: Vec<f32> = (0..16000)
            .map(|i| (2.0 * std::f32::consts::PI * 250.0 * i as f32 / 16000.0).sin() * 0.8)
            .collect();
        let features = extractor
            .extract(&ConditionedSignal { samples: loud, sample_rate: 16000 })
            .unwrap();
        let prediction = model.classify(&features).unwrap();
        assert_eq!(prediction.label, "strong_angry");
        assert!((prediction.probabilities[1] - 0.75).abs() < 1e-9);
        assert!((prediction.probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert_eq!(prediction.score, 5.0);

        let quiet = extractor
            .extract(&ConditionedSignal { samples: vec![0.0; 16000], sample_rate: 16000 })
            .unwrap();
        let prediction = model.classify(&quiet).unwrap();
        assert_eq!(prediction.label, "normal_calm");
        assert_eq!(prediction.score, 1.2);
    }

    #[test]
    fn test_logistic_regression_softmax() {
        let artifact = ModelArtifact::from_json(
            r#"{
                "format_version": 1,
                "labels": ["normal_happy", "strong_fearful"],
                "feature_columns": ["rms_mean"],
                "classifier": {"kind": "logistic_regression", "coefficients": [[-10.0], [10.0]], "intercepts": [0.0, 0.0]}
            }"#,
        )
        .unwrap();
        let probs = EmotionModel { artifact }.predict_proba(&[0.5]);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(probs[1] > 0.99);
    }
}
