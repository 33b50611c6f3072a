//! Spreadsheet-style step labels.
//!
//! Step sequence numbers map to labels the way spreadsheet columns do:
//! 1 -> "A", 26 -> "Z", 27 -> "AA", 52 -> "AZ", 53 -> "BA". Labels double
//! as the dependency-reference tokens in `depends_on`, so `number_for`
//! must be the exact inverse of `label_for`.

use crate::error::{EngineError, EngineResult};

/// Encode a 1-based sequence number as a bijective base-26 label.
///
/// Zero is not a valid sequence number: the underlying arithmetic has no
/// meaningful digit for it, so it is rejected instead of producing "".
pub fn label_for(n: u32) -> EngineResult<String> {
    if n == 0 {
        return Err(EngineError::Validation(
            "step number must be >= 1".to_string(),
        ));
    }
    let mut num = n;
    let mut chars: Vec<char> = Vec::new();
    while num > 0 {
        // Bijective base 26: digits run 1..=26, no zero digit.
        let mut quotient = num / 26;
        let mut digit = num % 26;
        if digit == 0 {
            quotient -= 1;
            digit = 26;
        }
        chars.push((b'A' + (digit - 1) as u8) as char);
        num = quotient;
    }
    Ok(chars.iter().rev().collect())
}

/// Decode a label back to its 1-based sequence number.
pub fn number_for(label: &str) -> EngineResult<u32> {
    if label.is_empty() {
        return Err(EngineError::Parse("empty step label".to_string()));
    }
    let mut num: u32 = 0;
    for c in label.chars() {
        if !c.is_ascii_uppercase() {
            return Err(EngineError::Parse(format!(
                "invalid character {c:?} in step label {label:?}"
            )));
        }
        num = num
            .checked_mul(26)
            .and_then(|n| n.checked_add((c as u8 - b'A') as u32 + 1))
            .ok_or_else(|| EngineError::Parse(format!("step label {label:?} out of range")))?;
    }
    Ok(num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_labels() {
        assert_eq!(label_for(1).unwrap(), "A");
        assert_eq!(label_for(2).unwrap(), "B");
        assert_eq!(label_for(26).unwrap(), "Z");
        assert_eq!(label_for(27).unwrap(), "AA");
        assert_eq!(label_for(52).unwrap(), "AZ");
        assert_eq!(label_for(53).unwrap(), "BA");
        assert_eq!(label_for(702).unwrap(), "ZZ");
        assert_eq!(label_for(703).unwrap(), "AAA");
    }

    #[test]
    fn test_zero_is_rejected() {
        assert!(label_for(0).is_err());
    }

    #[test]
    fn test_round_trip() {
        for n in 1..=20_000 {
            let label = label_for(n).unwrap();
            assert_eq!(number_for(&label).unwrap(), n, "label {label}");
        }
    }

    #[test]
    fn test_labels_strictly_increase() {
        // Ordered by (length, lexical), labels grow with the number.
        let mut prev = label_for(1).unwrap();
        for n in 2..=5_000 {
            let label = label_for(n).unwrap();
            assert!(
                (label.len(), label.as_str()) > (prev.len(), prev.as_str()),
                "{prev} -> {label}"
            );
            prev = label;
        }
    }

    #[test]
    fn test_invalid_labels() {
        assert!(number_for("").is_err());
        assert!(number_for("a").is_err());
        assert!(number_for("A1").is_err());
        assert!(number_for("A B").is_err());
    }
}
