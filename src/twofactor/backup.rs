use std::collections::HashSet;

use rand::Rng;

pub const BACKUP_CODE_COUNT: usize = 10;

/// Generates `count` pairwise-distinct codes shaped `XXXX-XXXX` (uppercase
/// hex) from the thread-local CSPRNG.
#[must_use]
pub fn generate_backup_codes(count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    let mut seen = HashSet::with_capacity(count);
    let mut codes = Vec::with_capacity(count);

    while codes.len() < count {
        let code = format!("{:04X}-{:04X}", rng.r#gen::<u16>(), rng.r#gen::<u16>());
        if seen.insert(code.clone()) {
            codes.push(code);
        }
    }

    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn well_formed(code: &str) -> bool {
        let bytes = code.as_bytes();
        bytes.len() == 9
            && bytes[4] == b'-'
            && bytes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != 4)
                .all(|(_, b)| b.is_ascii_digit() || (b'A'..=b'F').contains(b))
    }

    #[test]
    fn test_shape_and_uniqueness() {
        let codes = generate_backup_codes(BACKUP_CODE_COUNT);
        assert_eq!(codes.len(), 10);
        assert!(codes.iter().all(|c| well_formed(c)), "{codes:?}");

        let unique: HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn test_large_batch_stays_unique() {
        let codes = generate_backup_codes(2000);
        let unique: HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), 2000);
    }
}
