// Chorus Moderation — Lexicons
// Curated word and emoji lists used by the feature extractor, the scorer,
// the sentiment analyzer and the question detector. All entries lowercase.

/// Low-content chat filler. Drives the filler-word ratio.
pub const FILLER_WORDS: &[&str] = &[
    "gg", "lol", "omg", "wtf", "bro", "dude", "yea", "yeah", "yep", "nah", "xd", "lmao", "w",
    "f", "rip", "kys", "ez", "op", "nerf", "buff",
];

/// Words that carry meaning in a chat context. Drives semantic density.
pub const SEMANTIC_WORDS: &[&str] = &[
    // English
    "how", "what", "where", "when", "why", "who", "which", "can", "will", "should", "good",
    "great", "nice", "best", "love", "like", "hate", "bad", "worst", "better", "think", "know",
    "see", "want", "need", "help", "play", "watch", "work", "do",
    // Russian
    "вопрос", "ответ", "проблема", "решение", "игра", "трансляция", "стрим", "чат", "как",
    "что", "где", "когда", "почему", "кто", "какой", "могу", "нужно", "помощь",
];

pub const POSITIVE_WORDS: &[&str] = &[
    "nice", "good", "great", "amazing", "awesome", "love", "wow", "epic", "best", "perfect",
    "beautiful", "fantastic", "excellent", "wonderful", "gg", "wp", "gj", "gr8", "lit", "fire",
    "goat", "legend", "king", "queen", "clutch", "insane", "cracked", "godlike", "pog",
    "poggers", "pogchamp",
];

pub const NEGATIVE_WORDS: &[&str] = &[
    "bad", "trash", "terrible", "awful", "hate", "disgusting", "horrible", "fuck", "shit",
    "damn", "wtf", "omg", "crap", "stupid", "idiot", "moron", "worst", "fail", "fucking", "kys",
    "afk", "noob", "toxic", "garbage", "noooo", "nooo", "nooooo", "nope", "ew", "yuck", "ugh",
    "bleh",
];

pub const POSITIVE_EMOJI: &[&str] = &[
    "😊", "😁", "😂", "😍", "❤️", "💕", "👍", "🔥", "🎉", "🥳", "✨", "⭐", "💯", "🎮", "🎯", "🏆",
    "👑", "💪", "🤘", "🎊", "🎈", "🌈",
];

pub const NEGATIVE_EMOJI: &[&str] = &[
    "😢", "😡", "😔", "💔", "👎", "💩", "😤", "🤬", "😞", "😰", "😭", "🤮",
];

/// Interrogative openers. Multi-word entries match as a prefix phrase.
pub const QUESTION_OPENERS: &[&str] = &[
    "кто", "что", "где", "зачем", "почему", "когда", "как", "можно", "есть ли",
    "не думаешь ли", "who", "what", "where", "why", "when", "how", "can", "is", "are",
];

pub const QUESTION_EMOJI: &[&str] = &["🤔", "❓", "⁉️", "❔"];

pub fn is_filler(word: &str) -> bool {
    FILLER_WORDS.contains(&word)
}

pub fn is_semantic(word: &str) -> bool {
    SEMANTIC_WORDS.contains(&word)
}

/// Emoji blocks counted by the emoji ratio: emoticons, pictographs,
/// transport, regional indicators, misc symbols, dingbats.
pub fn is_emoji(c: char) -> bool {
    matches!(
        c as u32,
        0x1F600..=0x1F64F
            | 0x1F300..=0x1F5FF
            | 0x1F680..=0x1F6FF
            | 0x1F1E0..=0x1F1FF
            | 0x2600..=0x26FF
            | 0x2700..=0x27BF
    )
}
