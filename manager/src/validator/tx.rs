//! Transaction responses and failure classification.

use serde::Deserialize;

use super::ValidatorError;

/// The fields of `--output json` broadcast results we look at.
#[derive(Debug, Deserialize)]
pub struct TxResponse {
    pub txhash: String,
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub raw_log: String,
}

/// Parses the first JSON object in `stdout`. Some node versions print a
/// gas estimate line before it.
pub fn parse_response(stdout: &[u8]) -> Result<TxResponse, ValidatorError> {
    let text = String::from_utf8_lossy(stdout);
    let start = text.find('{').ok_or_else(|| ValidatorError::Parse {
        what: "transaction response",
        message: format!("no JSON object in {:?}", truncate(&text, 120)),
    })?;
    serde_json::from_str(&text[start..]).map_err(|e| ValidatorError::Parse {
        what: "transaction response",
        message: e.to_string(),
    })
}

/// Maps node/chain error text onto a typed failure, or `None` when the
/// text matches nothing known.
pub fn classify(text: &str) -> Option<ValidatorError> {
    let lower = text.to_lowercase();
    let detail = || first_meaningful_line(text);

    if lower.contains("insufficient funds") || lower.contains("insufficient fee") {
        return Some(ValidatorError::InsufficientFunds(detail()));
    }
    if lower.contains("key not found") || lower.contains("not a valid name or address") {
        return Some(ValidatorError::KeyNotFound(detail()));
    }
    if lower.contains("validator already exist") || lower.contains("already registered") {
        return Some(ValidatorError::AlreadyRegistered);
    }
    if lower.contains("validator not jailed") {
        return Some(ValidatorError::NotJailed);
    }
    if lower.contains("validator still jailed") || lower.contains("cannot be unjailed") {
        return Some(ValidatorError::JailNotExpired(detail()));
    }
    if lower.contains("inactive proposal")
        || lower.contains("voting period")
        || lower.contains("proposal not found")
    {
        return Some(ValidatorError::VotingClosed(detail()));
    }
    if lower.contains("connection refused")
        || lower.contains("post failed")
        || lower.contains("context deadline exceeded")
        || lower.contains("i/o timeout")
        || lower.contains("no such host")
    {
        return Some(ValidatorError::Network(detail()));
    }
    None
}

fn first_meaningful_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("gas estimate"))
        .map(|l| truncate(l, 240).to_string())
        .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_after_gas_estimate_line() {
        let out = b"gas estimate: 231000\n{\"txhash\":\"ABC\",\"code\":0,\"raw_log\":\"\"}\n";
        let resp = parse_response(out).expect("parsed");
        assert_eq!(resp.txhash, "ABC");
        assert_eq!(resp.code, 0);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            parse_response(b"Error: unknown command"),
            Err(ValidatorError::Parse { .. })
        ));
    }

    #[test]
    fn known_failures_are_classified() {
        assert!(matches!(
            classify("failed to execute message; message index: 0: spendable balance 1upc is smaller than 5upc: insufficient funds"),
            Some(ValidatorError::InsufficientFunds(_))
        ));
        assert!(matches!(
            classify("Error: validator-key.info: key not found"),
            Some(ValidatorError::KeyNotFound(_))
        ));
        assert!(matches!(
            classify("validator already exist for this operator address"),
            Some(ValidatorError::AlreadyRegistered)
        ));
        assert!(matches!(
            classify("validator still jailed; cannot be unjailed"),
            Some(ValidatorError::JailNotExpired(_))
        ));
        assert!(matches!(classify("validator not jailed; cannot be unjailed"), Some(ValidatorError::NotJailed)));
        assert!(matches!(
            classify("9: inactive proposal"),
            Some(ValidatorError::VotingClosed(_))
        ));
        assert!(matches!(
            classify("post failed: Post \"http://127.0.0.1:26657\": dial tcp: connection refused"),
            Some(ValidatorError::Network(_))
        ));
        assert!(classify("something else entirely").is_none());
    }
}
