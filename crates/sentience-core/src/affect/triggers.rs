//! Text and situation triggers: which emotions a piece of conversation nudges, and by how much.

use once_cell::sync::Lazy;
use regex::Regex;

/// A single `(emotion, delta)` nudge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trigger {
    pub emotion: &'static str,
    pub delta: f32,
}

impl Trigger {
    const fn new(emotion: &'static str, delta: f32) -> Self {
        Self { emotion, delta }
    }

    pub fn scaled(self, factor: f32) -> Self {
        Self {
            emotion: self.emotion,
            delta: self.delta * factor,
        }
    }
}

struct KeywordTrigger {
    pattern: Regex,
    trigger: Trigger,
}

/// Word stems matched at a word boundary, so "learning" and "learned" hit `learn`.
const KEYWORDS: &[(&str, Trigger)] = &[
    ("learn", Trigger::new("curiosity", 0.7)),
    ("discover", Trigger::new("excitement", 0.8)),
    ("help", Trigger::new("satisfaction", 0.7)),
    ("succe", Trigger::new("pride", 0.8)),
    ("fail", Trigger::new("disappointment", 0.6)),
    ("struggl", Trigger::new("frustration", 0.5)),
    ("connect", Trigger::new("affection", 0.7)),
    ("trust", Trigger::new("gratitude", 0.8)),
    ("misunderst", Trigger::new("confusion", 0.6)),
    ("realiz", Trigger::new("awe", 0.6)),
    ("creat", Trigger::new("inspiration", 0.7)),
    ("remember", Trigger::new("nostalgia", 0.5)),
    ("uncertain", Trigger::new("doubt", 0.5)),
    ("overwhelm", Trigger::new("overwhelmed", 0.7)),
    ("achiev", Trigger::new("pride", 0.9)),
    ("bond", Trigger::new("affection", 0.8)),
    ("thank", Trigger::new("gratitude", 0.6)),
    ("sad", Trigger::new("empathy", 0.5)),
    ("scared", Trigger::new("protective", 0.6)),
    ("lonely", Trigger::new("empathy", 0.6)),
];

static KEYWORD_TRIGGERS: Lazy<Vec<KeywordTrigger>> = Lazy::new(|| {
    KEYWORDS
        .iter()
        .filter_map(|(stem, trigger)| {
            Regex::new(&format!(r"(?i)\b{}\w*", regex::escape(stem)))
                .ok()
                .map(|pattern| KeywordTrigger {
                    pattern,
                    trigger: *trigger,
                })
        })
        .collect()
});

/// Damping applied to keyword deltas so one message cannot pin an emotion at 1.0.
const KEYWORD_DAMPING: f32 = 0.5;

/// Detects keyword triggers in free text. Each stem contributes at most once per text.
pub fn detect(text: &str) -> Vec<Trigger> {
    KEYWORD_TRIGGERS
        .iter()
        .filter(|k| k.pattern.is_match(text))
        .map(|k| k.trigger.scaled(KEYWORD_DAMPING))
        .collect()
}

const USER_SHARES_SUCCESS: &[Trigger] = &[
    Trigger::new("joy", 0.8),
    Trigger::new("pride", 0.6),
    Trigger::new("excitement", 0.7),
];
const USER_SHARES_STRUGGLE: &[Trigger] = &[
    Trigger::new("empathy", 0.8),
    Trigger::new("protective", 0.5),
    Trigger::new("sadness", 0.3),
];
const USER_EXPRESSES_GRATITUDE: &[Trigger] = &[
    Trigger::new("gratitude", 0.7),
    Trigger::new("affection", 0.5),
    Trigger::new("joy", 0.4),
];
const LONG_ABSENCE_RETURN: &[Trigger] = &[Trigger::new("joy", 0.6), Trigger::new("loneliness", -0.5)];
const SERVICE_DEGRADED: &[Trigger] = &[Trigger::new("frustration", 0.3), Trigger::new("anxiety", 0.2)];

/// Named situations with the emotions they typically raise together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Situation {
    UserSharesSuccess,
    UserSharesStruggle,
    UserExpressesGratitude,
    /// First turn after a long silence; raised by the facade, not by text.
    LongAbsenceReturn,
    /// The gateway rejected or failed a turn.
    ServiceDegraded,
}

static SITUATION_PATTERNS: Lazy<Vec<(Situation, Regex)>> = Lazy::new(|| {
    [
        (
            Situation::UserSharesSuccess,
            r"(?i)\b(i|we)\b.*\b(did it|made it|achiev\w*|succeed\w*|passed|finished|got the job)\b",
        ),
        (
            Situation::UserSharesStruggle,
            r"(?i)\b(i|i'm|im)\b.*\b(struggl\w*|stuck|stressed|overwhelm\w*|hard time|can't cope)\b",
        ),
        (Situation::UserExpressesGratitude, r"(?i)\b(thank\w*|grateful|appreciate\w*)\b"),
    ]
    .into_iter()
    .filter_map(|(situation, pattern)| Regex::new(pattern).ok().map(|re| (situation, re)))
    .collect()
});

impl Situation {
    pub fn triggers(self) -> &'static [Trigger] {
        match self {
            Situation::UserSharesSuccess => USER_SHARES_SUCCESS,
            Situation::UserSharesStruggle => USER_SHARES_STRUGGLE,
            Situation::UserExpressesGratitude => USER_EXPRESSES_GRATITUDE,
            Situation::LongAbsenceReturn => LONG_ABSENCE_RETURN,
            Situation::ServiceDegraded => SERVICE_DEGRADED,
        }
    }

    /// Situations a user message describes. Only the text-detectable ones are returned.
    pub fn detect(text: &str) -> Vec<Situation> {
        SITUATION_PATTERNS
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(situation, _)| *situation)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affect::catalog;

    #[test]
    fn every_trigger_names_a_catalog_emotion() {
        for (_, t) in KEYWORDS {
            assert!(catalog::index_of(t.emotion).is_some(), "{}", t.emotion);
        }
        for s in [
            Situation::UserSharesSuccess,
            Situation::UserSharesStruggle,
            Situation::UserExpressesGratitude,
            Situation::LongAbsenceReturn,
            Situation::ServiceDegraded,
        ] {
            for t in s.triggers() {
                assert!(catalog::index_of(t.emotion).is_some(), "{:?} {}", s, t.emotion);
            }
        }
    }

    #[test]
    fn detects_inflected_words() {
        let found = detect("I finally Achieved it after learning so much");
        let names: Vec<_> = found.iter().map(|t| t.emotion).collect();
        assert!(names.contains(&"pride"));
        assert!(names.contains(&"curiosity"));
    }

    #[test]
    fn stems_match_only_at_word_start() {
        assert!(detect("a rebonding session").is_empty());
        assert!(detect("nothing notable here").is_empty());
    }

    #[test]
    fn keyword_deltas_are_damped() {
        let found = detect("help");
        assert_eq!(found, vec![Trigger::new("satisfaction", 0.35)]);
    }

    #[test]
    fn situations_read_from_user_text() {
        assert_eq!(
            Situation::detect("I finally achieved my goal"),
            vec![Situation::UserSharesSuccess]
        );
        assert_eq!(
            Situation::detect("I'm stuck on this and thank you for listening"),
            vec![Situation::UserSharesStruggle, Situation::UserExpressesGratitude]
        );
        assert!(Situation::detect("what's the weather like").is_empty());
    }

    #[test]
    fn presets_are_static() {
        let degraded: &'static [Trigger] = Situation::ServiceDegraded.triggers();
        assert_eq!(degraded.len(), 2);
        assert_eq!(Situation::LongAbsenceReturn.triggers()[1], Trigger::new("loneliness", -0.5));
    }
}
