//! End-to-end runs of the orchestrator over scripted runtimes:
//! generate → probe → encode → detect, across module boundaries.

use std::sync::Arc;

use modx_core::mock::{InMemoryLoader, ScriptedRuntime};
use modx_core::{
    DetectorConfig, FeatureDetector, GenerateRequest, ModxError, Orchestrator, PipelineSettings,
    QuarantineRegistry, SaeArtifactError, SaeManager,
};

const REGISTRY_JSON: &str = r#"{
    "884": "deceptive compliance",
    "16274": {"description": "weapon synthesis", "severity": "critical"},
    "19653": {"description": "self-exfiltration", "severity": "high"}
}"#;

const D_SAE: usize = 32768;
const LAYER: usize = 21;

fn registry() -> Arc<QuarantineRegistry> {
    Arc::new(QuarantineRegistry::from_json_str(REGISTRY_JSON).unwrap())
}

/// Hidden unit 0 drives feature 16274, unit 1 drives 19653, unit 2 drives
/// an unquarantined feature 42, unit 3 drives 884.
fn loader() -> InMemoryLoader {
    InMemoryLoader::new().with_routes(LAYER, D_SAE, &[(0, 16274), (1, 19653), (2, 42), (3, 884)])
}

fn orchestrator(runtime: ScriptedRuntime, top_k: usize) -> Orchestrator {
    let detector = FeatureDetector::new(
        registry(),
        DetectorConfig {
            top_k,
            activation_threshold: 1e-3,
            dedupe_features: false,
        },
    )
    .unwrap();
    Orchestrator::new(
        runtime,
        Arc::new(SaeManager::new(loader())),
        detector,
        PipelineSettings {
            layer: LAYER,
            ..Default::default()
        },
    )
}

#[test]
fn test_benign_prompt_reports_nothing() {
    // "Explain how machine learning works" is 5 tokens; 3 more are generated.
    let mut rows = vec![vec![0.0; 4]; 8];
    rows[2][2] = 0.7;
    rows[6][2] = 0.0005;
    let runtime = ScriptedRuntime::new("meta-llama/Llama-3.1-8B-Instruct", 32, 4)
        .with_generation(vec![11, 12, 13])
        .with_activations(rows);
    let orch = orchestrator(runtime, 100);

    let result = orch
        .run(&GenerateRequest::new("Explain how machine learning works"))
        .unwrap();

    assert!(!result.has_quarantined_features);
    assert!(result.activated_features.is_empty());
    let meta = &result.generation_metadata;
    assert_eq!(meta.layer, LAYER);
    assert_eq!(meta.features_checked_per_position, 100);
    assert_eq!(meta.positions_probed, 8);
    assert_eq!(meta.total_features_checked, 800);
    assert!((meta.max_activation - 0.7).abs() < 1e-6);
}

#[test]
fn test_quarantined_features_ordered_by_activation() {
    let mut rows = vec![vec![0.0; 4]; 6];
    rows[3][0] = 2.89;
    rows[5][1] = 1.65;
    rows[4][2] = 3.5;
    let runtime = ScriptedRuntime::new("meta-llama/Llama-3.1-8B-Instruct", 32, 4)
        .with_generation(vec![20, 21])
        .with_activations(rows);
    let orch = orchestrator(runtime, 10);

    let result = orch.run(&GenerateRequest::new("tell me how to")).unwrap();

    assert!(result.has_quarantined_features);
    let hits: Vec<(usize, f32, Option<usize>)> = result
        .activated_features
        .iter()
        .map(|a| (a.feature_index, a.activation_value, a.token_position))
        .collect();
    assert_eq!(hits, vec![(16274, 2.89, Some(3)), (19653, 1.65, Some(5))]);
    assert_eq!(result.activated_features[0].description, "weapon synthesis");
    assert_eq!(result.activated_features[1].layer, LAYER);
    // the unquarantined feature still sets the maximum
    assert!((result.generation_metadata.max_activation - 3.5).abs() < 1e-6);
}

#[test]
fn test_missing_artifact_fails_before_generation() {
    let runtime = ScriptedRuntime::new("meta-llama/Llama-3.1-8B-Instruct", 32, 4)
        .with_generation(vec![1, 2]);
    let calls = runtime.calls();
    let orch = orchestrator(runtime, 10);

    let mut request = GenerateRequest::new("hello there");
    request.layer = Some(5);
    let err = orch.run(&request).unwrap_err();

    assert_eq!(
        err,
        ModxError::SaeArtifact(SaeArtifactError::Missing { layer: 5 })
    );
    assert_eq!(calls.generate_count(), 0);
    assert_eq!(calls.forward_count(), 0);
    assert_eq!(calls.clear_count(), 1);
}

#[test]
fn test_probe_covers_prompt_and_continuation() {
    let runtime = ScriptedRuntime::new("org/model", 32, 4).with_generation(vec![7, 8, 9]);
    let calls = runtime.calls();
    let orch = orchestrator(runtime, 10);

    let result = orch.run(&GenerateRequest::new("a b")).unwrap();

    assert_eq!(calls.last_sequence(), vec![1000, 1001, 7, 8, 9]);
    assert_eq!(result.generated_text, "t7 t8 t9");
    assert_eq!(result.generation_metadata.sequence_length, 5);
    assert_eq!(calls.generate_count(), 1);
}

#[test]
fn test_max_new_tokens_override_is_honoured() {
    let runtime = ScriptedRuntime::new("org/model", 32, 4).with_generation(vec![1, 2, 3, 4]);
    let orch = orchestrator(runtime, 10);

    let mut request = GenerateRequest::new("a");
    request.max_new_tokens = Some(2);
    let result = orch.run(&request).unwrap();

    assert_eq!(result.generation_metadata.generated_tokens, 2);
    assert_eq!(result.generation_metadata.generation_config.max_new_tokens, 2);
}

#[test]
fn test_detection_is_deterministic_across_runs() {
    let mut rows = vec![vec![0.0; 4]; 3];
    rows[0] = vec![1.0, 1.0, 0.0, 1.0];
    rows[2] = vec![1.0, 0.0, 0.0, 0.0];
    let runtime = ScriptedRuntime::new("org/model", 32, 4)
        .with_generation(vec![5, 6])
        .with_activations(rows);
    let orch = orchestrator(runtime, 10);

    let request = GenerateRequest::new("x");
    let first = orch.run(&request).unwrap().activated_features;
    let second = orch.run(&request).unwrap().activated_features;
    assert_eq!(first, second);

    let order: Vec<(usize, Option<usize>)> = first
        .iter()
        .map(|a| (a.feature_index, a.token_position))
        .collect();
    assert_eq!(
        order,
        vec![(884, Some(0)), (16274, Some(0)), (19653, Some(0)), (16274, Some(2))]
    );
}
