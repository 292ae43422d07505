mod cache;
mod complexity;
mod config;
mod intent;
mod scorer;

pub use cache::DecisionCache;
pub use complexity::{assess_complexity, ComplexityAssessment};
pub use config::{ComplexityWeights, LengthBucket, RouterConfig, RouterKeywords};
pub use intent::infer_intent;
pub use scorer::{AvailabilityView, FullyAvailable, Router};
