use serde::{Deserialize, Serialize};

/// Complexity bucket derived from the numeric score: `low` < 30, `high` ≥ 70.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=29 => Complexity::Low,
            70..=u8::MAX => Complexity::High,
            _ => Complexity::Medium,
        }
    }
}

/// Categorical label inferred from query keywords; variants listed in
/// tie-break priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Security,
    Development,
    Planning,
    Database,
    General,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Security => "security",
            Intent::Development => "development",
            Intent::Planning => "planning",
            Intent::Database => "database",
            Intent::General => "general",
        }
    }
}

/// Deterministic routing output for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub chosen_agent_id: String,
    pub complexity: Complexity,
    pub complexity_score: u8,
    pub confidence: f64,
    pub intent: Intent,
    pub required_skills: Vec<String>,
    pub fallback_agent_id: Option<String>,
    pub reason: String,
}
