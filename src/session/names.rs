//! Session naming.

use uuid::Uuid;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "deft", "eager", "fuzzy", "gentle", "hardy", "icy", "jolly",
    "keen", "lucid", "mellow", "nimble", "quiet", "rapid", "sunny", "tidy", "vivid", "witty",
];

const ANIMALS: &[&str] = &[
    "badger", "crane", "dingo", "egret", "ferret", "gecko", "heron", "ibis", "jackal", "koala",
    "lemur", "marten", "newt", "otter", "puffin", "quail", "raven", "stoat", "tapir", "wombat",
];

/// Maximum length of a session name
pub const MAX_NAME_LEN: usize = 63;

/// Random `adjective-animal-NNNN` name
pub fn generate_name() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let animal = ANIMALS[bytes[1] as usize % ANIMALS.len()];
    let number = u16::from_be_bytes([bytes[2], bytes[3]]) % 10_000;
    format!("{}-{}-{:04}", adjective, animal, number)
}

/// Names double as instance and volume names: `[a-z0-9][a-z0-9_.-]{0,62}`.
pub fn validate_name(name: &str) -> std::result::Result<(), String> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err("cannot be empty".to_string()),
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        Some(_) => return Err("must start with a lowercase letter or digit".to_string()),
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("must be at most {} characters", MAX_NAME_LEN));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-')) {
        return Err("may only contain a-z, 0-9, '_', '.', '-'".to_string());
    }
    Ok(())
}
