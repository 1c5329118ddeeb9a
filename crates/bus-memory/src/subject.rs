use crate::Error;

/// Checks a subject used for publishing: non-empty tokens, no wildcards, no whitespace.
pub(crate) fn validate_publish_subject(subject: &str) -> Result<(), Error> {
    if subject
        .split('.')
        .any(|token| token.is_empty() || token == "*" || token == ">")
        || subject.chars().any(char::is_whitespace)
    {
        return Err(Error::InvalidSubject(subject.to_string()));
    }

    Ok(())
}

/// Checks a subject used for subscribing: like publishing, but `*` may stand
/// for any token and a trailing `>` for one or more tokens.
pub(crate) fn validate_subscribe_subject(subject: &str) -> Result<(), Error> {
    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;

    let valid = !subject.chars().any(char::is_whitespace)
        && tokens
            .iter()
            .enumerate()
            .all(|(i, token)| !token.is_empty() && (*token != ">" || i == last));

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSubject(subject.to_string()))
    }
}

/// Whether `subject` is matched by `pattern`.
pub(crate) fn subject_matches(subject: &str, pattern: &str) -> bool {
    if subject == pattern {
        return true;
    }

    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    if pattern_tokens.last() == Some(&">") {
        let prefix = &pattern_tokens[..pattern_tokens.len() - 1];
        return subject_tokens.len() > prefix.len()
            && prefix
                .iter()
                .zip(&subject_tokens)
                .all(|(p, s)| *p == "*" || p == s);
    }

    subject_tokens.len() == pattern_tokens.len()
        && pattern_tokens
            .iter()
            .zip(&subject_tokens)
            .all(|(p, s)| *p == "*" || p == s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_wildcard_matching() {
        assert!(subject_matches("orders.created", "orders.created"));
        assert!(subject_matches("orders.created", "orders.*"));
        assert!(subject_matches("orders.eu.created", "orders.>"));
        assert!(subject_matches("orders.eu.created", "*.eu.*"));

        assert!(!subject_matches("orders", "orders.>"));
        assert!(!subject_matches("orders.eu.created", "orders.*"));
        assert!(!subject_matches("payments.created", "orders.*"));
    }

    #[test]
    fn test_subject_validation() {
        assert!(validate_publish_subject("orders.created").is_ok());
        assert!(validate_publish_subject("").is_err());
        assert!(validate_publish_subject("orders..created").is_err());
        assert!(validate_publish_subject("orders.*").is_err());
        assert!(validate_publish_subject("orders created").is_err());

        assert!(validate_subscribe_subject("orders.*").is_ok());
        assert!(validate_subscribe_subject("orders.>").is_ok());
        assert!(validate_subscribe_subject("orders.>.created").is_err());
        assert!(validate_subscribe_subject("").is_err());
    }
}
