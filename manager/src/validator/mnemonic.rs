//! Recovery phrase checks run before anything is handed to the node binary.

use bip39::Mnemonic;

use super::ValidatorError;

pub const ACCEPTED_WORD_COUNTS: [usize; 2] = [12, 24];

/// Normalises whitespace and case, then checks the word count and the
/// English BIP-39 word list and checksum.
pub fn validate(phrase: &str) -> Result<String, ValidatorError> {
    let words: Vec<String> = phrase
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    if !ACCEPTED_WORD_COUNTS.contains(&words.len()) {
        return Err(ValidatorError::InvalidMnemonic(format!(
            "expected 12 or 24 words, got {}",
            words.len()
        )));
    }
    let normalized = words.join(" ");
    Mnemonic::parse_normalized(&normalized)
        .map_err(|e| ValidatorError::InvalidMnemonic(e.to_string()))?;
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWELVE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn accepts_valid_phrase_with_sloppy_spacing() {
        let sloppy = format!("  {}  ", TWELVE.to_uppercase().replace(' ', "   "));
        assert_eq!(validate(&sloppy).expect("valid"), TWELVE);
    }

    #[test]
    fn rejects_wrong_word_count() {
        let err = validate("abandon abandon abandon").expect_err("too short");
        assert!(err.to_string().contains("got 3"));
    }

    #[test]
    fn rejects_unknown_word_and_bad_checksum() {
        let unknown = TWELVE.replace("about", "zzzzz");
        assert!(validate(&unknown).is_err());
        let bad_checksum = TWELVE.replace("about", "abandon");
        assert!(validate(&bad_checksum).is_err());
    }
}
