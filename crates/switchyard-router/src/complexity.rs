//! Deterministic complexity scoring.
//!
//! The score is an integer sum of weighted signals clamped to [0, 100].
//! Classifying the same query twice must yield identical scores, so nothing
//! here reads clocks, randomness, or shared state.

use switchyard_types::Complexity;

use crate::config::{ComplexityWeights, RouterKeywords};

#[derive(Debug, Clone)]
pub struct ComplexityAssessment {
    pub score: u8,
    pub complexity: Complexity,
    /// High-complexity keywords that matched; feeds required_skills.
    pub matched_high: Vec<String>,
    pub matched_medium: Vec<String>,
    pub high_hit: bool,
}

/// Case-insensitive keyword test.
///
/// Phrases match as substrings. A trailing `*` marks a stem: the boundary is
/// only required before the match, so `scalab*` hits both "scalable" and
/// "scalability". Plain single words match on word boundaries, so `hi` never
/// fires inside "high".
pub(crate) fn contains_keyword(text: &str, keyword: &str) -> bool {
    if keyword.contains(' ') {
        return text.contains(keyword);
    }
    let (needle, prefix_only) = match keyword.strip_suffix('*') {
        Some(stem) => (stem, true),
        None => (keyword, false),
    };
    if needle.is_empty() {
        return false;
    }
    let mut start = 0;
    while let Some(pos) = text[start..].find(needle) {
        let at = start + pos;
        let before_ok = at == 0
            || !text[..at]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let end = at + needle.len();
        let after_ok = prefix_only
            || end >= text.len()
            || !text[end..].chars().next().is_some_and(|c| c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = end;
        if start >= text.len() {
            break;
        }
    }
    false
}

fn count_occurrences(text: &str, needle: &str) -> usize {
    text.match_indices(needle).count()
}

pub fn assess_complexity(
    query: &str,
    history_turns: usize,
    keywords: &RouterKeywords,
    weights: &ComplexityWeights,
) -> ComplexityAssessment {
    let lowered = query.to_lowercase();
    let mut score: i32 = 0;

    // Length buckets.
    let len = query.chars().count();
    let mut bucketed = false;
    for bucket in &weights.length_buckets {
        if len < bucket.max_chars {
            score += bucket.points;
            bucketed = true;
            break;
        }
    }
    if !bucketed {
        score += weights.length_over;
    }

    // Keyword classes.
    let matched_high = keywords
        .high
        .iter()
        .filter(|kw| contains_keyword(&lowered, kw.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    let high_hit = !matched_high.is_empty();
    if high_hit {
        score += weights.high_base + weights.high_per_keyword * matched_high.len() as i32;
    }

    let matched_medium = keywords
        .medium
        .iter()
        .filter(|kw| contains_keyword(&lowered, kw.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    if !matched_medium.is_empty() {
        // Reduced contribution once the high class already fired.
        let (base, per) = if high_hit {
            (
                weights.medium_base_reduced,
                weights.medium_per_keyword_reduced,
            )
        } else {
            (weights.medium_base, weights.medium_per_keyword)
        };
        score += base + per * matched_medium.len() as i32;
    }

    for (keyword, points) in &keywords.low {
        if contains_keyword(&lowered, keyword) {
            score += points;
        }
    }

    // Code blocks. A fence is a pair of triple backticks; leftover single
    // backticks pair up into inline snippets.
    let triple = count_occurrences(query, "```");
    let fences = triple / 2;
    score += weights.code_fence * fences as i32;
    let total_ticks = query.matches('`').count();
    let inline = total_ticks.saturating_sub(triple * 3) / 2;
    score += weights.inline_code * inline as i32;

    // Known file extensions.
    for ext in &keywords.file_extensions {
        if lowered.contains(&format!(".{}", ext)) {
            score += weights.file_extension;
        }
    }

    // Structural markers.
    for marker in &keywords.multipart {
        if lowered.contains(marker.as_str()) {
            score += weights.multipart_marker;
        }
    }
    for marker in &keywords.contextual {
        if lowered.contains(marker.as_str()) {
            score += weights.contextual_marker;
        }
    }
    for marker in &keywords.comparative {
        if lowered.contains(marker.as_str()) {
            score += weights.comparative_marker;
        }
    }

    // Question marks, capped.
    let questions = query.matches('?').count() as i32;
    score += (questions * weights.question_mark).min(weights.question_cap);

    // Reasoning prompts.
    score += weights.what_if * count_occurrences(&lowered, "what if") as i32;
    score += weights.why * count_word(&lowered, "why") as i32;
    score += weights.how * count_word(&lowered, "how") as i32;

    // Long-running conversations raise the stakes.
    if history_turns >= weights.history_min_turns {
        score += (weights.history_per_turn * history_turns as i32).min(weights.history_cap);
    }

    let score = score.clamp(0, 100) as u8;
    ComplexityAssessment {
        score,
        complexity: Complexity::from_score(score),
        matched_high,
        matched_medium,
        high_hit,
    }
}

fn count_word(text: &str, word: &str) -> usize {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| *w == word)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ComplexityWeights, RouterKeywords};

    fn assess(query: &str) -> ComplexityAssessment {
        assess_complexity(
            query,
            0,
            &RouterKeywords::default(),
            &ComplexityWeights::default(),
        )
    }

    #[test]
    fn greeting_scores_low() {
        let a = assess("hi, thanks!");
        assert!(a.score <= 30, "score was {}", a.score);
        assert_eq!(a.complexity, Complexity::Low);
    }

    #[test]
    fn architecture_query_scores_high() {
        let a = assess("refactor the scalable consensus architecture across the distributed pipeline");
        assert!(a.score >= 70, "score was {}", a.score);
        assert_eq!(a.complexity, Complexity::High);
        assert!(a.high_hit);
        assert!(a.matched_high.iter().any(|k| k == "consensus"));
    }

    #[test]
    fn scoring_is_deterministic() {
        let query = "why does the async runtime stall? what if we add backpressure?";
        let first = assess(query);
        let second = assess(query);
        assert_eq!(first.score, second.score);
    }

    #[test]
    fn code_fences_raise_score() {
        let plain = assess("explain this function for me today");
        let fenced = assess("explain this function for me today\n```rust\nfn main() {}\n```");
        assert!(fenced.score > plain.score);
    }

    #[test]
    fn question_marks_are_capped() {
        let a = assess("????????????????????");
        let b = assess("?????");
        assert_eq!(a.score, b.score);
    }

    #[test]
    fn history_bonus_is_capped() {
        let keywords = RouterKeywords::default();
        let weights = ComplexityWeights::default();
        let base = assess_complexity("describe the deploy steps for this release", 0, &keywords, &weights);
        let with_history =
            assess_complexity("describe the deploy steps for this release", 50, &keywords, &weights);
        assert_eq!(
            i32::from(with_history.score) - i32::from(base.score),
            weights.history_cap
        );
    }

    #[test]
    fn word_boundaries_protect_short_keywords() {
        // "hi" must not match inside "this".
        let a = assess("this architecture diagram needs consensus review");
        assert!(a.score > 30);
    }
}
