//! Grammar filters, pronoun mirroring and casing helpers.

use std::sync::LazyLock;

use regex::Regex;

/// Possessive pronouns a sentence must not end on.
pub const POSSESSIVES: &[&str] = &["his", "her", "my", "their", "our", "your", "its", "whose"];

/// Prepositions and wh-words a sentence should not end on.
pub const TERMINAL_WORDS: &[&str] = &[
    "of", "from", "where", "when", "at", "in", "on", "by", "with", "for", "to", "into", "about",
    "over", "under", "than",
];

const PRONOUNS: &str = "i|you|he|she|it|we|they";

static ARTICLE_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(a|an)\s+(a|an)\b").unwrap());
static A_PREPOSITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\ba\s+(of|in|on|at|by|with|for)\b").unwrap());
static SINGLE_LETTER_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-zA-Z]\s+[a-zA-Z]\b").unwrap());
static ARTICLE_PRONOUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b(a|an|the)\s+({PRONOUNS})\b")).unwrap()
});
static YOUR_YOU: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\byour\s+you\b").unwrap());
static I_FUNCTION_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bi\s+(the|a|an|to|of|in|on|at|by|with|for)\b").unwrap()
});
static PRONOUN_CLUSTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b({PRONOUNS})\s+({PRONOUNS})\b")).unwrap()
});
static PRONOUN_THE_PRONOUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b({PRONOUNS})\s+the\s+({PRONOUNS})\b")).unwrap()
});
static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").unwrap());

struct Span<'a> {
    word: &'a str,
    /// Text between this word and the next one (or the end).
    gap: &'a str,
}

fn spans(text: &str) -> Vec<Span<'_>> {
    let matches: Vec<_> = WORD.find_iter(text).collect();
    matches
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let gap_end = matches.get(i + 1).map_or(text.len(), |n| n.start());
            Span {
                word: m.as_str(),
                gap: &text[m.end()..gap_end],
            }
        })
        .collect()
}

fn is_blank_gap(gap: &str) -> bool {
    !gap.is_empty() && gap.chars().all(char::is_whitespace)
}

fn is_period_gap(gap: &str) -> bool {
    gap.strip_prefix('.').is_some_and(is_blank_gap)
}

/// `word word`, ignoring case, separated only by whitespace.
fn has_adjacent_duplicate(spans: &[Span<'_>]) -> bool {
    spans.windows(2).any(|w| {
        is_blank_gap(w[0].gap) && w[0].word.eq_ignore_ascii_case(w[1].word)
    })
}

/// `word. word.`
fn has_echoed_clause(spans: &[Span<'_>]) -> bool {
    spans.windows(2).any(|w| {
        is_period_gap(w[0].gap)
            && w[1].gap.starts_with('.')
            && w[0].word.eq_ignore_ascii_case(w[1].word)
    })
}

/// `a. b. a. b.`
fn has_letter_cycle(spans: &[Span<'_>]) -> bool {
    spans.windows(4).any(|w| {
        w.iter().take(3).all(|s| is_period_gap(s.gap))
            && w[3].gap.starts_with('.')
            && w.iter().all(|s| s.word.chars().count() == 1)
            && w[0].word.eq_ignore_ascii_case(w[2].word)
            && w[1].word.eq_ignore_ascii_case(w[3].word)
    })
}

/// A capital `The` that does not start a sentence.
fn has_mid_sentence_the(spans: &[Span<'_>]) -> bool {
    spans.iter().enumerate().skip(1).any(|(i, s)| {
        s.word == "The" && !spans[i - 1].gap.trim_start().starts_with(['.', '!', '?'])
    })
}

/// Capitalized (not all-caps) preposition or wh-word as the last word.
fn has_capitalized_terminal(spans: &[Span<'_>]) -> bool {
    let Some(last) = spans.last() else {
        return false;
    };
    let w = last.word;
    let mut chars = w.chars();
    let capitalized = chars.next().is_some_and(char::is_uppercase)
        && chars.clone().next().is_some()
        && chars.all(char::is_lowercase);
    capitalized && TERMINAL_WORDS.contains(&w.to_lowercase().as_str())
}

/// Heuristic grammar check for a candidate response.
pub fn passes_filters(text: &str) -> bool {
    if text.trim().is_empty() || text.contains("<s>") {
        return false;
    }
    let regexes: [&Regex; 8] = [
        &ARTICLE_PAIR,
        &A_PREPOSITION,
        &SINGLE_LETTER_PAIR,
        &ARTICLE_PRONOUN,
        &YOUR_YOU,
        &I_FUNCTION_WORD,
        &PRONOUN_CLUSTER,
        &PRONOUN_THE_PRONOUN,
    ];
    if regexes.iter().any(|re| re.is_match(text)) {
        return false;
    }
    let spans = spans(text);
    !(has_adjacent_duplicate(&spans)
        || has_echoed_clause(&spans)
        || has_letter_cycle(&spans)
        || has_mid_sentence_the(&spans)
        || has_capitalized_terminal(&spans))
}

/// Mirror first- and second-person pronouns (`I` ↔ `you`, `my` ↔ `your`, …).
pub fn swap_pronouns(words: &[String]) -> Vec<String> {
    words
        .iter()
        .map(|w| {
            let swapped = match w.as_str() {
                "I" | "i" => "you",
                "you" | "You" => "I",
                "my" => "your",
                "My" => "Your",
                "your" => "my",
                "Your" => "My",
                "me" => "you",
                "Me" => "You",
                "myself" => "yourself",
                "yourself" => "myself",
                "mine" => "yours",
                "yours" => "mine",
                other => other,
            };
            swapped.to_string()
        })
        .collect()
}

pub fn is_possessive(word: &str) -> bool {
    POSSESSIVES.contains(&word.to_lowercase().as_str())
}

pub fn is_terminal_word(word: &str) -> bool {
    TERMINAL_WORDS.contains(&word.to_lowercase().as_str())
}

pub fn is_single_char(word: &str) -> bool {
    word.chars().count() == 1
}

fn is_all_lowercase(word: &str) -> bool {
    word.chars().all(|c| !c.is_uppercase())
}

/// Uppercase the first letter of an all-lowercase word; anything with an
/// uppercase letter (acronyms, mixed case) is returned as is.
pub fn capitalize_first(word: &str) -> String {
    if !is_all_lowercase(word) {
        return word.to_string();
    }
    let mut chars = word.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Transfer the casing of `original` onto `replacement`: all-caps stays
/// all-caps, a leading capital capitalizes, anything else is left as given.
pub fn match_casing(original: &str, replacement: &str) -> String {
    let letters: Vec<char> = original.chars().filter(|c| c.is_alphabetic()).collect();
    let all_caps = letters.len() > 1 && letters.iter().all(|c| c.is_uppercase());
    if all_caps {
        replacement.to_uppercase()
    } else if original.chars().next().is_some_and(char::is_uppercase) {
        capitalize_first(&replacement.to_lowercase())
    } else {
        replacement.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_preposition_casing() {
        for word in ["of", "from", "where", "when", "at"] {
            assert!(passes_filters(&format!("This ends with {word}.")));
            assert!(passes_filters(&format!("This ends with {}.", word.to_uppercase())));
            let cap = capitalize_first(word);
            assert!(!passes_filters(&format!("This ends with {cap}.")), "{cap}");
        }
    }

    #[test]
    fn rejects_known_bad_patterns() {
        for bad in [
            "",
            "   ",
            "this is a an apple",
            "look a of things",
            "the the cat",
            "Hello hello friend",
            "x y marks the spot",
            "we saw The cat",
            "give a she apple",
            "your you thing",
            "i the best",
            "you they went",
            "you the they",
            "<s> start",
            "stop. stop. go",
            "a. b. a. b.",
        ] {
            assert!(!passes_filters(bad), "should reject {bad:?}");
        }
    }

    #[test]
    fn accepts_ordinary_sentences() {
        for good in [
            "Hello WORLD foo bar baz.",
            "The cat sat. The dog ran.",
            "I think you went home.",
            "Silence echoes within void.",
        ] {
            assert!(passes_filters(good), "should accept {good:?}");
        }
    }

    #[test]
    fn pronouns_mirror() {
        let words: Vec<String> = ["I", "like", "your", "Hat"].iter().map(|s| s.to_string()).collect();
        assert_eq!(swap_pronouns(&words), vec!["you", "like", "my", "Hat"]);
    }

    #[test]
    fn casing_helpers() {
        assert_eq!(capitalize_first("hello"), "Hello");
        assert_eq!(capitalize_first("NASA"), "NASA");
        assert_eq!(capitalize_first("iPhone"), "iPhone");
        assert_eq!(match_casing("WORLD", "globe"), "GLOBE");
        assert_eq!(match_casing("NASA", "space"), "SPACE");
        assert_eq!(match_casing("Hello", "hi"), "Hi");
        assert_eq!(match_casing("iPhone", "smartphone"), "smartphone");
        assert_eq!(match_casing("friend", "buddy"), "buddy");
        assert!(is_possessive("Their"));
        assert!(is_terminal_word("OF"));
    }
}
