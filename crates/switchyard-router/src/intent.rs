//! Intent inference by keyword-class counting.

use switchyard_types::Intent;

use crate::complexity::contains_keyword;
use crate::config::RouterKeywords;

/// Count keyword hits per class and pick the densest one. Ties (and the
/// zero-hit case) resolve in declared priority order: security >
/// development > planning > database > general.
pub fn infer_intent(query: &str, keywords: &RouterKeywords) -> Intent {
    let lowered = query.to_lowercase();
    let count = |list: &[String]| -> usize {
        list.iter()
            .filter(|kw| contains_keyword(&lowered, kw.as_str()))
            .count()
    };

    let ranked = [
        (Intent::Security, count(&keywords.intent_security)),
        (Intent::Development, count(&keywords.intent_development)),
        (Intent::Planning, count(&keywords.intent_planning)),
        (Intent::Database, count(&keywords.intent_database)),
        (Intent::General, count(&keywords.intent_general)),
    ];

    let best = ranked
        .iter()
        .max_by_key(|(_, count)| *count)
        .map(|(_, count)| *count)
        .unwrap_or(0);
    if best == 0 {
        return Intent::General;
    }
    ranked
        .iter()
        .find(|(_, count)| *count == best)
        .map(|(intent, _)| *intent)
        .unwrap_or(Intent::General)
}
