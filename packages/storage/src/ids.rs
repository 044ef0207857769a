// ABOUTME: Identifier generation for stored entities
// ABOUTME: 64 hex characters that never start with the reserved prefix

use rand::RngCore;

/// Request paths such as `/containers/create` share a segment position with
/// container ids, so no generated id may begin with this character.
pub const RESERVED_ID_PREFIX: char = 'c';

pub const ID_LENGTH: usize = 64;

/// A random identifier. Collision checks against existing rows are the
/// store's job; this only guarantees shape and the reserved prefix.
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; ID_LENGTH / 2];
    loop {
        rng.fill_bytes(&mut bytes);
        let id = hex::encode(bytes);
        if !id.starts_with(RESERVED_ID_PREFIX) {
            return id;
        }
    }
}

pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LENGTH
        && !id.starts_with(RESERVED_ID_PREFIX)
        && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
