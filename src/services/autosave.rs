//! Heuristics deciding which exchanges are worth remembering unprompted,
//! and the keyword tags attached to them.

use std::collections::BTreeSet;

const POSITIVE_EMOTIONS: &[&str] = &[
    "joy",
    "surprise",
    "admiration",
    "love",
    "excitement",
    "delight",
    "satisfaction",
];

const POSITIVE_TRIGGERS: &[&str] = &[
    // admiration
    "amazing",
    "stunning",
    "brilliant",
    "magical",
    "phenomenal",
    "bravo!",
    // gratitude
    "thank you so much",
    "you're a wonder",
    "you are the best",
    "love you",
    // surprise
    "wow!",
    "mind blown",
    "you read my mind",
    "incredible!",
    "unbelievable!",
    // approval
    "perfect!",
    "top notch",
    "beautiful!",
];

const GREETINGS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "good morning",
    "good afternoon",
    "good evening",
    "good night",
    "how are you",
    "what's up",
];

const FORMAL_REPLIES: &[&str] = &[
    "yes",
    "no",
    "ok",
    "okay",
    "sure",
    "fine",
    "got it",
    "understood",
    "agreed",
    "thanks",
    "thank you",
    "please",
    "bye",
    "goodbye",
    "see you",
    "help",
];

const TAG_CATEGORIES: &[(&str, &[&str])] = &[
    ("places", &["church", "library", "quarter", "square", "village", "city", "market"]),
    ("people", &["keeper", "elder", "grandmother", "grandfather", "stranger"]),
    ("objects", &["brooch", "lamp", "scroll", "book", "archive", "ring", "amulet"]),
    ("emotions", &["anxiety", "sadness", "joy", "fear", "wonder"]),
    ("style", &["magic realism", "balkans", "mysticism", "symbolism"]),
];

/// Why an exchange was not auto-saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Too short, a greeting, a command, or a formal one-word reply.
    Excluded,
    /// Neither a positive emotion nor a trigger phrase.
    NoTrigger,
}

pub fn is_excluded(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    if lowered.chars().count() < 3 || lowered.starts_with('/') {
        return true;
    }
    let bare = lowered.trim_end_matches(['!', '.', '?']);
    if FORMAL_REPLIES.contains(&bare) || GREETINGS.contains(&bare) {
        return true;
    }
    GREETINGS.iter().any(|greeting| {
        lowered
            .strip_prefix(greeting)
            .and_then(|rest| rest.chars().next())
            .is_some_and(|next| !next.is_alphanumeric())
    })
}

pub fn has_positive_emotion(emotion: Option<&str>) -> bool {
    emotion.is_some_and(|e| POSITIVE_EMOTIONS.contains(&e.trim().to_lowercase().as_str()))
}

pub fn has_positive_trigger(text: &str) -> bool {
    let lowered = text.to_lowercase();
    POSITIVE_TRIGGERS.iter().any(|trigger| lowered.contains(trigger))
}

/// Exclusions win over triggers.
pub fn evaluate(emotion: Option<&str>, user_message: &str) -> Result<(), SkipReason> {
    if is_excluded(user_message) {
        return Err(SkipReason::Excluded);
    }
    if has_positive_emotion(emotion) || has_positive_trigger(user_message) {
        Ok(())
    } else {
        Err(SkipReason::NoTrigger)
    }
}

pub fn should_auto_save(emotion: Option<&str>, user_message: &str) -> bool {
    evaluate(emotion, user_message).is_ok()
}

/// Category keywords found in either side of the exchange; lower-case,
/// deduplicated, sorted.
pub fn extract_contextual_tags(user_message: &str, bot_response: &str) -> Vec<String> {
    let combined = format!("{} {}", user_message, bot_response).to_lowercase();
    let tags: BTreeSet<String> = TAG_CATEGORIES
        .iter()
        .flat_map(|(_, keywords)| keywords.iter())
        .filter(|keyword| combined.contains(*keyword))
        .map(|keyword| keyword.to_string())
        .collect();
    tags.into_iter().collect()
}
