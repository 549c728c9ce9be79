#![forbid(unsafe_code)]

//! Text matching strategies used by configurable patterns.
//!
//! Every strategy returns a [`MatchResult`] whose score lives in `[0, 1]`.
//! Unmatched results always carry a score of zero so that callers can rank
//! results by score alone. Invalid or unsafe expressions are treated as
//! non-matches and never surface as errors.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::debug;

use crate::error::FilterError;
use crate::models::{Pattern, PatternContext, PatternType};

pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.8;
pub const DEFAULT_SEMANTIC_THRESHOLD: f64 = 0.7;

const KEYWORD_EXACT_SCORE: f64 = 1.0;
const KEYWORD_CONTAINS_SCORE: f64 = 0.7;
const KEYWORD_WORD_SCORE: f64 = 0.5;
const WILDCARD_BASE_SCORE: f64 = 0.5;
const WILDCARD_STAR_BONUS: f64 = 0.2;
const WILDCARD_SINGLE_BONUS: f64 = 0.1;
const WILDCARD_PLUS_BONUS: f64 = 0.15;
const WILDCARD_GROUP_BONUS: f64 = 0.15;
const REGEX_SCORE: f64 = 0.8;
const FUZZY_CONTAINS_SCORE: f64 = 0.9;
const SEMANTIC_PHRASE_BONUS: f64 = 0.3;
const SEMANTIC_MIN_TOKEN_CHARS: usize = 3;

// Bounds for compiled user expressions. The regex crate matches in linear
// time, so compile size is the only budget left to enforce.
const REGEX_SIZE_LIMIT: usize = 1 << 20;
const REGEX_DFA_SIZE_LIMIT: usize = 2 << 20;

/// Shapes rejected before a user regex is ever compiled.
static UNSAFE_REGEX_SHAPES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\(\?=",
        r"\(\?!",
        r"\(\*",
        r"\{[^}]*\}",
        r"\(\?[=!][^)]*\)\*",
        r"\(\.\+\)\\1",
    ]
    .into_iter()
    .filter_map(|shape| Regex::new(shape).ok())
    .collect()
});

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub matched: bool,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_text: Option<String>,
}

impl MatchResult {
    pub fn none() -> Self {
        Self {
            matched: false,
            score: 0.0,
            matched_text: None,
        }
    }

    fn hit(score: f64, matched_text: impl Into<String>) -> Self {
        Self {
            matched: true,
            score: score.clamp(0.0, 1.0),
            matched_text: Some(matched_text.into()),
        }
    }
}

/// Best weighted match across a pattern set, with the winning pattern kept so
/// the caller can update its hit counters.
#[derive(Debug, Clone)]
pub struct PatternsMatch<'p> {
    pub result: MatchResult,
    pub pattern: Option<&'p Pattern>,
}

/// Evaluates patterns and memoizes every regex it had to build, keyed by the
/// generated expression. Failed compilations are memoized as `None`.
#[derive(Debug, Default)]
pub struct PatternMatcher {
    compiled: RwLock<HashMap<String, Option<Regex>>>,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the strategy selected by `pattern.pattern_type`.
    pub fn evaluate(&self, text: &str, pattern: &Pattern) -> MatchResult {
        match pattern.pattern_type {
            PatternType::Keyword => self.keyword_match(text, &pattern.pattern),
            PatternType::Wildcard => self.wildcard_match(text, &pattern.pattern),
            PatternType::Regex => self.regex_match(text, &pattern.pattern),
            PatternType::Fuzzy => fuzzy_match(
                text,
                &pattern.pattern,
                pattern.match_threshold.unwrap_or(DEFAULT_FUZZY_THRESHOLD),
            ),
            PatternType::Semantic => semantic_match(
                text,
                &pattern.pattern,
                pattern.match_threshold.unwrap_or(DEFAULT_SEMANTIC_THRESHOLD),
            ),
        }
    }

    /// Case-insensitive keyword search: exact equality, then substring, then
    /// whole-word boundary.
    pub fn keyword_match(&self, text: &str, keyword: &str) -> MatchResult {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            return MatchResult::none();
        }
        let haystack = text.to_lowercase();
        if haystack.trim() == needle {
            return MatchResult::hit(KEYWORD_EXACT_SCORE, text.trim());
        }
        if haystack.contains(&needle) {
            return MatchResult::hit(KEYWORD_CONTAINS_SCORE, needle);
        }

        let expression = format!(r"(?i)\b{}\b", regex::escape(&needle));
        match self
            .compile(expression, false)
            .and_then(|regex| regex.find(text).map(|found| found.as_str().to_string()))
        {
            Some(found) => MatchResult::hit(KEYWORD_WORD_SCORE, found),
            None => MatchResult::none(),
        }
    }

    /// Anchored glob match. `*`, `?` and `+` behave like `.*`, `.` and `.+`;
    /// `{a|b}` is an alternation group. Everything else is literal.
    pub fn wildcard_match(&self, text: &str, pattern: &str) -> MatchResult {
        if pattern.trim().is_empty() {
            return MatchResult::none();
        }
        let Some(regex) = self.compile(wildcard_to_regex(pattern), true) else {
            return MatchResult::none();
        };
        if !regex.is_match(text) {
            return MatchResult::none();
        }
        MatchResult::hit(wildcard_score(pattern), text)
    }

    /// User-supplied expression, matched case-insensitively against the
    /// original text.
    pub fn regex_match(&self, text: &str, pattern: &str) -> MatchResult {
        if pattern.trim().is_empty() || is_unsafe_regex(pattern) {
            return MatchResult::none();
        }
        match self
            .compile(pattern.to_string(), true)
            .and_then(|regex| regex.find(text).map(|found| found.as_str().to_string()))
        {
            Some(found) => MatchResult::hit(REGEX_SCORE, found),
            None => MatchResult::none(),
        }
    }

    /// Evaluates every active pattern bound to `context` and keeps the one with
    /// the highest weighted score. Patterns whose weighted score is zero never
    /// win.
    pub fn match_patterns<'p>(
        &self,
        text: &str,
        patterns: &'p [Pattern],
        context: PatternContext,
    ) -> PatternsMatch<'p> {
        let mut best = PatternsMatch {
            result: MatchResult::none(),
            pattern: None,
        };

        for pattern in patterns
            .iter()
            .filter(|pattern| pattern.is_active && pattern.context == context)
        {
            let result = self.evaluate(text, pattern);
            if !result.matched {
                continue;
            }
            let weighted = result.score * pattern.weight.clamp(0.0, 1.0);
            if weighted > best.result.score {
                best = PatternsMatch {
                    result: MatchResult {
                        score: weighted,
                        ..result
                    },
                    pattern: Some(pattern),
                };
            }
        }

        best
    }

    pub fn compiled_count(&self) -> usize {
        self.compiled.read().len()
    }

    pub fn clear(&self) {
        self.compiled.write().clear();
    }

    fn compile(&self, expression: String, case_insensitive: bool) -> Option<Regex> {
        let key = if case_insensitive {
            format!("i:{expression}")
        } else {
            format!("s:{expression}")
        };
        if let Some(cached) = self.compiled.read().get(&key) {
            return cached.clone();
        }

        let compiled = match build_regex(&expression, case_insensitive) {
            Ok(regex) => Some(regex),
            Err(err) => {
                debug!(expression = %expression, error = %err, "pattern failed to compile");
                None
            }
        };
        self.compiled.write().insert(key, compiled.clone());
        compiled
    }
}

fn build_regex(expression: &str, case_insensitive: bool) -> Result<Regex, regex::Error> {
    RegexBuilder::new(expression)
        .case_insensitive(case_insensitive)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_DFA_SIZE_LIMIT)
        .build()
}

/// Accepts a user regex only if [`PatternMatcher::regex_match`] would
/// actually run it: no refused shapes, and it compiles within the same size
/// limits.
pub fn validate_regex(pattern: &str) -> Result<(), FilterError> {
    if is_unsafe_regex(pattern) {
        return Err(FilterError::validation(
            "regex uses lookarounds, counted repetition or backreferences",
        ));
    }
    build_regex(pattern, true)
        .map(|_| ())
        .map_err(|err| FilterError::validation(format!("invalid regex: {err}")))
}

/// True when `pattern` contains a shape we refuse to run.
pub fn is_unsafe_regex(pattern: &str) -> bool {
    UNSAFE_REGEX_SHAPES
        .iter()
        .any(|shape| shape.is_match(pattern))
}

/// Translates a glob into an anchored regular expression, escaping every
/// literal run.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut index = 0;
    while index < chars.len() {
        match chars[index] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '+' => out.push_str(".+"),
            '{' => {
                let close = chars[index + 1..]
                    .iter()
                    .position(|c| *c == '}')
                    .map(|offset| index + 1 + offset);
                match close {
                    Some(end) => {
                        let inner: String = chars[index + 1..end].iter().collect();
                        let alternatives: Vec<String> =
                            inner.split('|').map(regex::escape).collect();
                        out.push('(');
                        out.push_str(&alternatives.join("|"));
                        out.push(')');
                        index = end;
                    }
                    None => out.push_str(r"\{"),
                }
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
        index += 1;
    }
    out.push('$');
    out
}

fn wildcard_score(pattern: &str) -> f64 {
    let mut score = WILDCARD_BASE_SCORE;
    if pattern.contains('*') {
        score += WILDCARD_STAR_BONUS;
    }
    if pattern.contains('?') {
        score += WILDCARD_SINGLE_BONUS;
    }
    if pattern.contains('+') {
        score += WILDCARD_PLUS_BONUS;
    }
    if pattern.contains('{') {
        score += WILDCARD_GROUP_BONUS;
    }
    score.min(1.0)
}

/// Edit-distance similarity. Exact and substring matches short-circuit.
pub fn fuzzy_match(text: &str, pattern: &str, threshold: f64) -> MatchResult {
    let a = text.trim().to_lowercase();
    let b = pattern.trim().to_lowercase();
    if a == b {
        return MatchResult::hit(1.0, text.trim());
    }
    if !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a)) {
        return MatchResult::hit(FUZZY_CONTAINS_SCORE, pattern.trim());
    }

    let longest = a.chars().count().max(b.chars().count());
    let similarity = 1.0 - levenshtein(&a, &b) as f64 / longest as f64;
    if similarity > 0.0 && similarity >= threshold {
        MatchResult::hit(similarity, text.trim())
    } else {
        MatchResult::none()
    }
}

/// Token-overlap similarity with a bonus when the whole pattern appears
/// verbatim in the text.
pub fn semantic_match(text: &str, pattern: &str, threshold: f64) -> MatchResult {
    let text_lower = text.to_lowercase();
    let pattern_lower = pattern.trim().to_lowercase();
    let text_tokens = significant_tokens(&text_lower);
    let pattern_tokens = significant_tokens(&pattern_lower);

    let largest = text_tokens.len().max(pattern_tokens.len());
    let overlap = if largest == 0 {
        0.0
    } else {
        text_tokens.intersection(&pattern_tokens).count() as f64 / largest as f64
    };
    let bonus = if !pattern_lower.is_empty() && text_lower.contains(&pattern_lower) {
        SEMANTIC_PHRASE_BONUS
    } else {
        0.0
    };

    let score = (overlap + bonus).min(1.0);
    if score > 0.0 && score >= threshold {
        MatchResult::hit(score, pattern.trim())
    } else {
        MatchResult::none()
    }
}

fn significant_tokens(text: &str) -> HashSet<&str> {
    text.split_whitespace()
        .filter(|token| token.chars().count() >= SEMANTIC_MIN_TOKEN_CHARS)
        .collect()
}

/// Character-level Levenshtein distance using a single rolling row.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a.chars().count();
    }

    let mut row: Vec<usize> = (0..=b_chars.len()).collect();
    for (i, a_char) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, b_char) in b_chars.iter().enumerate() {
            let above = row[j + 1];
            let cost = usize::from(a_char != *b_char);
            row[j + 1] = (above + 1).min(row[j] + 1).min(diagonal + cost);
            diagonal = above;
        }
    }
    row[b_chars.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pattern(id: &str, body: &str, kind: PatternType, weight: f64) -> Pattern {
        Pattern {
            id: id.into(),
            pattern: body.into(),
            pattern_type: kind,
            context: PatternContext::Title,
            weight,
            match_threshold: None,
            is_active: true,
            match_count: 0,
            last_matched: None,
            category_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn keyword_scores_exact_substring_and_miss() {
        let matcher = PatternMatcher::new();
        assert_eq!(matcher.keyword_match("Spam", "spam").score, 1.0);

        let contained = matcher.keyword_match("This is SPAM content", "spam");
        assert!(contained.matched);
        assert_eq!(contained.score, 0.7);

        let missed = matcher.keyword_match("clean title", "spam");
        assert_eq!(missed, MatchResult::none());
        assert_eq!(matcher.keyword_match("anything", "   "), MatchResult::none());
    }

    #[test]
    fn keyword_match_is_idempotent() {
        let matcher = PatternMatcher::new();
        let first = matcher.keyword_match("Free gift cards inside", "gift");
        let second = matcher.keyword_match("Free gift cards inside", "gift");
        assert_eq!(first.matched, second.matched);
        assert_eq!(first.score, second.score);
    }

    #[test]
    fn wildcard_is_anchored() {
        let matcher = PatternMatcher::new();
        let hit = matcher.wildcard_match("foobar", "foo*");
        assert!(hit.matched);
        assert!((hit.score - 0.7).abs() < 1e-9);
        assert!(!matcher.wildcard_match("barfoo", "foo*").matched);
    }

    #[test]
    fn wildcard_supports_groups_and_escapes_literals() {
        let matcher = PatternMatcher::new();
        assert!(matcher.wildcard_match("buy cheap pills", "buy {cheap|free} *").matched);
        assert!(matcher.wildcard_match("BUY FREE stuff", "buy {cheap|free} *").matched);
        assert!(!matcher.wildcard_match("buy expensive pills", "buy {cheap|free} *").matched);
        // the dot is literal, not "any character"
        assert!(matcher.wildcard_match("v1.2", "v?.?").matched);
        assert!(!matcher.wildcard_match("v1x2", "v1.2").matched);

        let score = matcher.wildcard_match("ab-cd", "a?+{cd}*").score;
        assert!((score - 1.0).abs() < 1e-9, "score capped at 1.0, got {score}");
    }

    #[test]
    fn wildcard_translation() {
        assert_eq!(wildcard_to_regex("a*b?c+"), "^a.*b.c.+$");
        assert_eq!(wildcard_to_regex("{x|y}"), "^(x|y)$");
        assert_eq!(wildcard_to_regex("{open"), r"^\{open$");
        assert_eq!(wildcard_to_regex("(a)"), r"^\(a\)$");
    }

    #[test]
    fn regex_matches_original_case_text() {
        let matcher = PatternMatcher::new();
        let hit = matcher.regex_match("Win a FREE iPhone now", r"free\s+iphone");
        assert!(hit.matched);
        assert_eq!(hit.score, 0.8);
        assert_eq!(hit.matched_text.as_deref(), Some("FREE iPhone"));
    }

    #[test]
    fn unsafe_or_invalid_regex_never_matches() {
        let matcher = PatternMatcher::new();
        for body in ["(?=.*x)*", "(?!abc)", "(*FAIL)", "a{1,1000}", "(.+)\\1", "(unclosed"] {
            let result = matcher.regex_match("xxxx abc abcabc", body);
            assert_eq!(result, MatchResult::none(), "{body}");
        }
        assert!(is_unsafe_regex("(?=.*x)*"));
        assert!(!is_unsafe_regex(r"\bspam\b"));
    }

    #[test]
    fn validate_regex_uses_matcher_limits() {
        assert!(validate_regex(r"\bspam\b").is_ok());
        for body in ["(?=.*x)*", "a{1,1000}", "(.+)\\1", "(unclosed"] {
            assert!(validate_regex(body).is_err(), "{body}");
        }

        // Fits the regex crate's default budget but not ours.
        let oversized = "a".repeat(400_000);
        assert!(validate_regex(&oversized).is_err());
        let matcher = PatternMatcher::new();
        assert!(!matcher.regex_match(&oversized, &oversized).matched);
    }

    #[test]
    fn compiled_expressions_are_memoized() {
        let matcher = PatternMatcher::new();
        matcher.regex_match("one", "on.");
        matcher.regex_match("two", "on.");
        matcher.regex_match("two", "(broken");
        matcher.regex_match("two", "(broken");
        assert_eq!(matcher.compiled_count(), 2);
        matcher.clear();
        assert_eq!(matcher.compiled_count(), 0);
    }

    #[test]
    fn fuzzy_identical_strings_score_one() {
        for sample in ["", "a", "Some Title", "ünïcödé"] {
            let result = fuzzy_match(sample, sample, 0.0);
            assert!(result.matched);
            assert_eq!(result.score, 1.0);
        }
    }

    #[test]
    fn fuzzy_uses_normalized_edit_distance() {
        assert_eq!(fuzzy_match("free robux", "robux", 0.8).score, 0.9);

        // kitten -> sitting is 3 edits over 7 chars
        let result = fuzzy_match("kitten", "sitting", 0.5);
        assert!(result.matched);
        assert!((result.score - (1.0 - 3.0 / 7.0)).abs() < 1e-9);
        assert!(!fuzzy_match("kitten", "sitting", 0.8).matched);
        assert_eq!(fuzzy_match("kitten", "sitting", 0.8).score, 0.0);
    }

    #[test]
    fn levenshtein_distances() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("flaw", "lawn"), 2);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn semantic_overlap_and_phrase_bonus() {
        // tokens: {crypto, giveaway, live} vs {crypto, giveaway}; 2/3 + 0.3
        let result = semantic_match("Crypto giveaway live", "crypto giveaway", 0.7);
        assert!(result.matched);
        assert!((result.score - 0.9666666).abs() < 1e-4);

        // no phrase bonus: 1/3 overlap stays under the default threshold
        assert!(!semantic_match("crypto news today", "crypto scam", 0.7).matched);

        // short tokens are ignored entirely
        assert!(!semantic_match("a an to", "a an to x", 0.1).matched);
    }

    #[test]
    fn evaluate_respects_custom_threshold() {
        let matcher = PatternMatcher::new();
        let mut fuzzy = pattern("p", "sitting", PatternType::Fuzzy, 1.0);
        assert!(!matcher.evaluate("kitten", &fuzzy).matched);
        fuzzy.match_threshold = Some(0.5);
        assert!(matcher.evaluate("kitten", &fuzzy).matched);
    }

    #[test]
    fn match_patterns_keeps_highest_weighted_score() {
        let matcher = PatternMatcher::new();
        let mut other_context = pattern("ctx", "spam", PatternType::Keyword, 1.0);
        other_context.context = PatternContext::Description;
        let mut inactive = pattern("off", "spam", PatternType::Keyword, 1.0);
        inactive.is_active = false;
        let patterns = vec![
            other_context,
            inactive,
            pattern("low", "spam", PatternType::Keyword, 0.5),
            pattern("high", "spam*", PatternType::Wildcard, 1.0),
        ];

        let best = matcher.match_patterns("spam everywhere", &patterns, PatternContext::Title);
        assert!(best.result.matched);
        assert_eq!(best.pattern.map(|p| p.id.as_str()), Some("high"));
        assert!((best.result.score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn zero_weight_never_wins() {
        let matcher = PatternMatcher::new();
        let patterns = vec![
            pattern("zero", "spam", PatternType::Keyword, 0.0),
            pattern("tiny", "spam", PatternType::Keyword, 0.01),
        ];
        let best = matcher.match_patterns("spam", &patterns, PatternContext::Title);
        assert_eq!(best.pattern.map(|p| p.id.as_str()), Some("tiny"));

        let only_zero = vec![pattern("zero", "spam", PatternType::Keyword, 0.0)];
        let none = matcher.match_patterns("spam", &only_zero, PatternContext::Title);
        assert!(!none.result.matched);
        assert_eq!(none.result.score, 0.0);
        assert!(none.pattern.is_none());
    }
}
