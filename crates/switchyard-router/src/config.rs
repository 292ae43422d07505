//! Router configuration: keyword tables and signal weights.
//!
//! Everything here is overridable from the configuration tree; the defaults
//! encode the shipped scoring model.

use serde::{Deserialize, Serialize};

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterKeywords {
    /// Keywords that mark a query as high complexity.
    #[serde(default = "default_high")]
    pub high: Vec<String>,
    /// Keywords that mark a query as medium complexity.
    #[serde(default = "default_medium")]
    pub medium: Vec<String>,
    /// Low-effort markers with their (negative) score contributions.
    #[serde(default = "default_low")]
    pub low: Vec<(String, i32)>,
    #[serde(default = "default_intent_security")]
    pub intent_security: Vec<String>,
    #[serde(default = "default_intent_development")]
    pub intent_development: Vec<String>,
    #[serde(default = "default_intent_planning")]
    pub intent_planning: Vec<String>,
    #[serde(default = "default_intent_database")]
    pub intent_database: Vec<String>,
    #[serde(default = "default_intent_general")]
    pub intent_general: Vec<String>,
    /// Markers of multi-part asks ("also, ...").
    #[serde(default = "default_multipart")]
    pub multipart: Vec<String>,
    /// Markers of contextual dependency ("based on ...").
    #[serde(default = "default_contextual")]
    pub contextual: Vec<String>,
    /// Comparative markers ("versus", "trade-off").
    #[serde(default = "default_comparative")]
    pub comparative: Vec<String>,
    /// Known code file extensions (without the dot).
    #[serde(default = "default_file_extensions")]
    pub file_extensions: Vec<String>,
}

fn default_high() -> Vec<String> {
    strings(&[
        "architecture",
        "security",
        "distributed",
        "consensus",
        "scalab*",
        "refactor*",
        "optimiz*",
        "concurren*",
        "migration",
        "throughput",
        "fault toleran",
        "end-to-end",
    ])
}

fn default_medium() -> Vec<String> {
    strings(&[
        "review",
        "fix",
        "bug",
        "implement",
        "test",
        "integration",
        "debug",
        "endpoint",
        "deploy",
        "pipeline",
        "refine",
    ])
}

fn default_low() -> Vec<(String, i32)> {
    vec![
        ("hello".to_string(), -8),
        ("hi".to_string(), -8),
        ("hey".to_string(), -8),
        ("thanks".to_string(), -8),
        ("thank you".to_string(), -6),
        ("bye".to_string(), -6),
        ("ok".to_string(), -5),
        ("simple".to_string(), -5),
        ("quick".to_string(), -4),
        ("please".to_string(), -3),
        ("format".to_string(), -3),
    ]
}

fn default_intent_security() -> Vec<String> {
    strings(&[
        "security",
        "vulnerab*",
        "exploit*",
        "auth*",
        "encrypt*",
        "penetration",
        "injection",
        "audit*",
        "cve",
    ])
}

fn default_intent_development() -> Vec<String> {
    strings(&[
        "implement*",
        "refactor*",
        "code",
        "build",
        "fix",
        "bug",
        "function",
        "api",
        "compile*",
        "deploy*",
        "pipeline",
        "library",
    ])
}

fn default_intent_planning() -> Vec<String> {
    strings(&[
        "plan",
        "roadmap",
        "design",
        "architecture",
        "strategy",
        "estimate",
        "milestone",
        "prioriti*",
    ])
}

fn default_intent_database() -> Vec<String> {
    strings(&[
        "database", "sql", "query", "schema", "index", "postgres", "migration", "table",
    ])
}

fn default_intent_general() -> Vec<String> {
    strings(&["hello", "hi", "thanks", "help", "what", "explain", "summar*"])
}

fn default_multipart() -> Vec<String> {
    strings(&["also,", "additionally,", "furthermore,", "and then", "as well as"])
}

fn default_contextual() -> Vec<String> {
    strings(&["based on", "given the", "considering", "in the context of"])
}

fn default_comparative() -> Vec<String> {
    strings(&["versus", " vs ", "compared to", "trade-off", "tradeoff", "better than"])
}

fn default_file_extensions() -> Vec<String> {
    strings(&[
        "rs", "py", "js", "ts", "go", "java", "c", "cpp", "h", "rb", "sql", "sh", "yaml", "toml",
        "json",
    ])
}

impl Default for RouterKeywords {
    fn default() -> Self {
        Self {
            high: default_high(),
            medium: default_medium(),
            low: default_low(),
            intent_security: default_intent_security(),
            intent_development: default_intent_development(),
            intent_planning: default_intent_planning(),
            intent_database: default_intent_database(),
            intent_general: default_intent_general(),
            multipart: default_multipart(),
            contextual: default_contextual(),
            comparative: default_comparative(),
            file_extensions: default_file_extensions(),
        }
    }
}

/// Length bucket: queries up to `max_chars` contribute `points`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LengthBucket {
    pub max_chars: usize,
    pub points: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityWeights {
    #[serde(default = "default_length_buckets")]
    pub length_buckets: Vec<LengthBucket>,
    /// Contribution for queries longer than the last bucket.
    #[serde(default = "default_length_over")]
    pub length_over: i32,
    #[serde(default = "default_high_base")]
    pub high_base: i32,
    #[serde(default = "default_high_per_keyword")]
    pub high_per_keyword: i32,
    #[serde(default = "default_medium_base")]
    pub medium_base: i32,
    #[serde(default = "default_medium_per_keyword")]
    pub medium_per_keyword: i32,
    /// Medium contributions when a high keyword already hit.
    #[serde(default = "default_medium_base_reduced")]
    pub medium_base_reduced: i32,
    #[serde(default = "default_medium_per_keyword_reduced")]
    pub medium_per_keyword_reduced: i32,
    #[serde(default = "default_code_fence")]
    pub code_fence: i32,
    #[serde(default = "default_inline_code")]
    pub inline_code: i32,
    #[serde(default = "default_file_extension")]
    pub file_extension: i32,
    #[serde(default = "default_multipart_marker")]
    pub multipart_marker: i32,
    #[serde(default = "default_contextual_marker")]
    pub contextual_marker: i32,
    #[serde(default = "default_comparative_marker")]
    pub comparative_marker: i32,
    #[serde(default = "default_question_mark")]
    pub question_mark: i32,
    #[serde(default = "default_question_cap")]
    pub question_cap: i32,
    #[serde(default = "default_why")]
    pub why: i32,
    #[serde(default = "default_how")]
    pub how: i32,
    #[serde(default = "default_what_if")]
    pub what_if: i32,
    #[serde(default = "default_history_min_turns")]
    pub history_min_turns: usize,
    #[serde(default = "default_history_per_turn")]
    pub history_per_turn: i32,
    #[serde(default = "default_history_cap")]
    pub history_cap: i32,
}

fn default_length_buckets() -> Vec<LengthBucket> {
    vec![
        LengthBucket {
            max_chars: 30,
            points: -5,
        },
        LengthBucket {
            max_chars: 100,
            points: 0,
        },
        LengthBucket {
            max_chars: 300,
            points: 5,
        },
        LengthBucket {
            max_chars: 800,
            points: 10,
        },
        LengthBucket {
            max_chars: 1_500,
            points: 15,
        },
        LengthBucket {
            max_chars: 3_000,
            points: 20,
        },
    ]
}

fn default_length_over() -> i32 {
    25
}
fn default_high_base() -> i32 {
    30
}
fn default_high_per_keyword() -> i32 {
    18
}
fn default_medium_base() -> i32 {
    22
}
fn default_medium_per_keyword() -> i32 {
    10
}
fn default_medium_base_reduced() -> i32 {
    8
}
fn default_medium_per_keyword_reduced() -> i32 {
    5
}
fn default_code_fence() -> i32 {
    25
}
fn default_inline_code() -> i32 {
    3
}
fn default_file_extension() -> i32 {
    3
}
fn default_multipart_marker() -> i32 {
    6
}
fn default_contextual_marker() -> i32 {
    8
}
fn default_comparative_marker() -> i32 {
    5
}
fn default_question_mark() -> i32 {
    3
}
fn default_question_cap() -> i32 {
    15
}
fn default_why() -> i32 {
    5
}
fn default_how() -> i32 {
    4
}
fn default_what_if() -> i32 {
    8
}
fn default_history_min_turns() -> usize {
    5
}
fn default_history_per_turn() -> i32 {
    2
}
fn default_history_cap() -> i32 {
    15
}

impl Default for ComplexityWeights {
    fn default() -> Self {
        Self {
            length_buckets: default_length_buckets(),
            length_over: default_length_over(),
            high_base: default_high_base(),
            high_per_keyword: default_high_per_keyword(),
            medium_base: default_medium_base(),
            medium_per_keyword: default_medium_per_keyword(),
            medium_base_reduced: default_medium_base_reduced(),
            medium_per_keyword_reduced: default_medium_per_keyword_reduced(),
            code_fence: default_code_fence(),
            inline_code: default_inline_code(),
            file_extension: default_file_extension(),
            multipart_marker: default_multipart_marker(),
            contextual_marker: default_contextual_marker(),
            comparative_marker: default_comparative_marker(),
            question_mark: default_question_mark(),
            question_cap: default_question_cap(),
            why: default_why(),
            how: default_how(),
            what_if: default_what_if(),
            history_min_turns: default_history_min_turns(),
            history_per_turn: default_history_per_turn(),
            history_cap: default_history_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub keywords: RouterKeywords,
    #[serde(default)]
    pub weights: ComplexityWeights,
    /// Minimum agent score per complexity bucket.
    #[serde(default = "default_min_confidence_high")]
    pub min_confidence_high: f64,
    #[serde(default = "default_min_confidence_medium")]
    pub min_confidence_medium: f64,
    #[serde(default = "default_min_confidence_low")]
    pub min_confidence_low: f64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Same agent serving the same session within this window is penalized.
    #[serde(default = "default_recency_window_secs")]
    pub recency_window_secs: u64,
    #[serde(default = "default_recency_penalty")]
    pub recency_penalty: f64,
}

fn default_min_confidence_high() -> f64 {
    0.5
}
fn default_min_confidence_medium() -> f64 {
    0.3
}
fn default_min_confidence_low() -> f64 {
    0.0
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_recency_window_secs() -> u64 {
    60
}
fn default_recency_penalty() -> f64 {
    0.7
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            keywords: RouterKeywords::default(),
            weights: ComplexityWeights::default(),
            min_confidence_high: default_min_confidence_high(),
            min_confidence_medium: default_min_confidence_medium(),
            min_confidence_low: default_min_confidence_low(),
            cache_ttl_secs: default_cache_ttl_secs(),
            recency_window_secs: default_recency_window_secs(),
            recency_penalty: default_recency_penalty(),
        }
    }
}
