/// Minting of client-visible conversation keys.
///
/// A conversation id is minted the first time a character is opened without
/// one and stays the conversation's permanent key; nothing is written to
/// storage at mint time. Uniqueness is probabilistic (128-bit random token),
/// determinism is not required.
pub trait IdGenerator: Send + Sync {
    fn mint(&self) -> String;
}

pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn mint(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_distinct_and_well_formed() {
        let ids = UuidGenerator;
        let a = ids.mint();
        let b = ids.mint();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }
}
