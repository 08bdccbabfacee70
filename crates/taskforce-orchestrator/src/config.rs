use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use taskforce_core::{TaskforceError, TaskforceResult};

/// Weights used by the worker matcher. All additive; see
/// [`crate::matcher::score`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherPolicy {
    /// Multiplier applied to the capability-token overlap count.
    #[serde(default = "default_overlap_weight")]
    pub overlap_weight: f64,
    /// Flat bonus when the worker's tools are a superset of the task's
    /// required tools.
    #[serde(default = "default_superset_bonus")]
    pub tool_superset_bonus: f64,
    /// Bonus per individually matching tool.
    #[serde(default = "default_tool_match_bonus")]
    pub tool_match_bonus: f64,
    /// Penalty applied while the worker is busy.
    #[serde(default = "default_busy_penalty")]
    pub busy_penalty: f64,
    /// Additional penalty per task already queued on the worker.
    #[serde(default = "default_workload_penalty")]
    pub workload_penalty: f64,
    /// Model-quality bonus by model-identifier substring. Longest matching
    /// substring wins; unknown models get no bonus.
    #[serde(default = "default_model_tiers")]
    pub model_tiers: HashMap<String, f64>,
}

fn default_overlap_weight() -> f64 {
    1.5
}
fn default_superset_bonus() -> f64 {
    10.0
}
fn default_tool_match_bonus() -> f64 {
    2.0
}
fn default_busy_penalty() -> f64 {
    5.0
}
fn default_workload_penalty() -> f64 {
    0.5
}
fn default_model_tiers() -> HashMap<String, f64> {
    HashMap::from([
        ("opus".to_string(), 3.5),
        ("gpt-4".to_string(), 3.5),
        ("sonnet".to_string(), 3.3),
        ("haiku".to_string(), 3.0),
    ])
}

impl Default for MatcherPolicy {
    fn default() -> Self {
        Self {
            overlap_weight: default_overlap_weight(),
            tool_superset_bonus: default_superset_bonus(),
            tool_match_bonus: default_tool_match_bonus(),
            busy_penalty: default_busy_penalty(),
            workload_penalty: default_workload_penalty(),
            model_tiers: default_model_tiers(),
        }
    }
}

/// Coefficients of the linear token-estimate model:
/// `base + per_description_char * len + per_tool * tools + per_subtask * subtasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEstimatePolicy {
    #[serde(default = "default_base_tokens")]
    pub base_tokens: f64,
    #[serde(default = "default_per_description_char")]
    pub per_description_char: f64,
    #[serde(default = "default_per_tool")]
    pub per_tool: f64,
    #[serde(default = "default_per_subtask")]
    pub per_subtask: f64,
}

fn default_base_tokens() -> f64 {
    200.0
}
fn default_per_description_char() -> f64 {
    0.25
}
fn default_per_tool() -> f64 {
    50.0
}
fn default_per_subtask() -> f64 {
    150.0
}

impl Default for TokenEstimatePolicy {
    fn default() -> Self {
        Self {
            base_tokens: default_base_tokens(),
            per_description_char: default_per_description_char(),
            per_tool: default_per_tool(),
            per_subtask: default_per_subtask(),
        }
    }
}

/// Thresholds for adaptive mode selection: parallel execution is chosen
/// when `available_workers >= task_count * min_worker_ratio` and the number
/// of immediately-independent tasks exceeds `min_independent_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptivePolicy {
    #[serde(default = "default_min_worker_ratio")]
    pub min_worker_ratio: f64,
    #[serde(default = "default_min_independent_tasks")]
    pub min_independent_tasks: usize,
}

fn default_min_worker_ratio() -> f64 {
    0.5
}
fn default_min_independent_tasks() -> usize {
    1
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            min_worker_ratio: default_min_worker_ratio(),
            min_independent_tasks: default_min_independent_tasks(),
        }
    }
}

/// Per-model token pricing, in currency units per 1000 tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelRates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Cost model: per-model token rates plus a linear time-based charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostPolicy {
    /// Rate table keyed by model-identifier substring; longest match wins.
    #[serde(default = "default_rates")]
    pub rates: HashMap<String, ModelRates>,
    /// Fallback when no table entry matches.
    #[serde(default = "default_fallback_rates")]
    pub fallback: ModelRates,
    /// Utilization charge per second of wall-clock execution.
    #[serde(default = "default_time_charge_per_sec")]
    pub time_charge_per_sec: f64,
}

fn default_rates() -> HashMap<String, ModelRates> {
    HashMap::from([
        (
            "opus".to_string(),
            ModelRates {
                input_per_1k: 0.015,
                output_per_1k: 0.075,
            },
        ),
        (
            "sonnet".to_string(),
            ModelRates {
                input_per_1k: 0.003,
                output_per_1k: 0.015,
            },
        ),
        (
            "haiku".to_string(),
            ModelRates {
                input_per_1k: 0.0008,
                output_per_1k: 0.004,
            },
        ),
    ])
}
fn default_fallback_rates() -> ModelRates {
    ModelRates {
        input_per_1k: 0.003,
        output_per_1k: 0.015,
    }
}
fn default_time_charge_per_sec() -> f64 {
    0.0005
}

impl Default for CostPolicy {
    fn default() -> Self {
        Self {
            rates: default_rates(),
            fallback: default_fallback_rates(),
            time_charge_per_sec: default_time_charge_per_sec(),
        }
    }
}

impl CostPolicy {
    /// Rates for `model`, via longest-substring lookup.
    pub fn rates_for(&self, model: &str) -> ModelRates {
        self.rates
            .iter()
            .filter(|(key, _)| model.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, rates)| *rates)
            .unwrap_or(self.fallback)
    }

    /// Cost of one execution: token charges plus the time-based charge.
    pub fn cost(&self, model: &str, tokens_in: u64, tokens_out: u64, elapsed_secs: f64) -> f64 {
        let rates = self.rates_for(model);
        tokens_in as f64 / 1000.0 * rates.input_per_1k
            + tokens_out as f64 / 1000.0 * rates.output_per_1k
            + elapsed_secs * self.time_charge_per_sec
    }
}

/// Every tunable of the orchestration core. Loadable from TOML; all fields
/// default to the values the rest of this crate documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Bound on a single task execution, in seconds.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Interval of the background orchestration tick, in seconds.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Age after which an open negotiation is force-resolved, in seconds.
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,
    /// Age after which terminal negotiations and workflows are pruned,
    /// in seconds.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Maximum alternate-worker reassignments after a failed execution.
    #[serde(default = "default_max_reassignments")]
    pub max_reassignments: u32,
    /// Total token-budget pool capacity.
    #[serde(default = "default_token_budget")]
    pub token_budget: f64,
    /// Shared memory-pool capacity, in megabytes.
    #[serde(default = "default_memory_pool_mb")]
    pub memory_pool_mb: f64,
    /// Utilization above which the tick loop logs a warning.
    #[serde(default = "default_utilization_warn_threshold")]
    pub utilization_warn_threshold: f64,
    /// Fallback per-task duration estimate, in seconds.
    #[serde(default = "default_task_duration_estimate_secs")]
    pub task_duration_estimate_secs: u64,
    #[serde(default)]
    pub matcher: MatcherPolicy,
    #[serde(default)]
    pub token_estimate: TokenEstimatePolicy,
    #[serde(default)]
    pub adaptive: AdaptivePolicy,
    #[serde(default)]
    pub cost: CostPolicy,
}

fn default_task_timeout_secs() -> u64 {
    300
}
fn default_tick_interval_secs() -> u64 {
    2
}
fn default_negotiation_timeout_secs() -> u64 {
    300
}
fn default_retention_secs() -> u64 {
    3600
}
fn default_max_reassignments() -> u32 {
    1
}
fn default_token_budget() -> f64 {
    1_000_000.0
}
fn default_memory_pool_mb() -> f64 {
    4096.0
}
fn default_utilization_warn_threshold() -> f64 {
    0.9
}
fn default_task_duration_estimate_secs() -> u64 {
    60
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
            retention_secs: default_retention_secs(),
            max_reassignments: default_max_reassignments(),
            token_budget: default_token_budget(),
            memory_pool_mb: default_memory_pool_mb(),
            utilization_warn_threshold: default_utilization_warn_threshold(),
            task_duration_estimate_secs: default_task_duration_estimate_secs(),
            matcher: MatcherPolicy::default(),
            token_estimate: TokenEstimatePolicy::default(),
            adaptive: AdaptivePolicy::default(),
            cost: CostPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse a config from TOML text. Missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> TaskforceResult<Self> {
        toml::from_str(text).map_err(|e| TaskforceError::Config(e.to_string()))
    }
}
