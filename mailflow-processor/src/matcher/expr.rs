//! Matcher expressions
//!
//! ```text
//! expr := term | term ("AND" | "OR") term
//! term := ["NOT"] atom
//! atom := Name ["=" condition]
//! ```
//!
//! Operators are whole upper-case words. Anything between operators is one
//! atom, so conditions may contain spaces (`RecipientIs=a@x, b@y`). Only a
//! single binary operator is accepted.

use std::sync::Arc;

use super::{And, Matcher, Not, Or};
use crate::error::ConfigError;

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Not,
    And,
    Or,
    Atom(String),
}

fn tokenize(spec: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut atom: Vec<&str> = Vec::new();

    for word in spec.split_whitespace() {
        let operator = match word {
            "NOT" => Token::Not,
            "AND" => Token::And,
            "OR" => Token::Or,
            _ => {
                atom.push(word);
                continue;
            }
        };

        if !atom.is_empty() {
            tokens.push(Token::Atom(atom.join(" ")));
            atom.clear();
        }
        tokens.push(operator);
    }

    if !atom.is_empty() {
        tokens.push(Token::Atom(atom.join(" ")));
    }

    tokens
}

/// Split an atom into its matcher name and optional condition
fn split_atom(atom: &str) -> (&str, Option<&str>) {
    atom.split_once('=')
        .map_or((atom.trim(), None), |(name, condition)| {
            (name.trim(), Some(condition.trim()))
        })
}

/// Parse `spec`, building each atom with `build`
///
/// # Errors
/// - [`ConfigError::MatcherTooComplex`] for more than one binary operator
/// - [`ConfigError::InvalidMatcher`] for anything else that does not follow
///   the grammar
/// - whatever `build` returns for an atom
pub fn parse<F>(spec: &str, build: F) -> Result<Arc<dyn Matcher>, ConfigError>
where
    F: Fn(&str, Option<&str>) -> Result<Arc<dyn Matcher>, ConfigError>,
{
    let invalid = |reason: &str| ConfigError::InvalidMatcher {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };

    let mut tokens = tokenize(spec).into_iter();
    let term = |tokens: &mut std::vec::IntoIter<Token>| -> Result<Arc<dyn Matcher>, ConfigError> {
        match tokens.next() {
            Some(Token::Not) => match tokens.next() {
                Some(Token::Atom(atom)) => {
                    let (name, condition) = split_atom(&atom);
                    Ok(Arc::new(Not::new(build(name, condition)?)))
                }
                _ => Err(invalid("NOT must be followed by a matcher")),
            },
            Some(Token::Atom(atom)) => {
                let (name, condition) = split_atom(&atom);
                build(name, condition)
            }
            Some(_) => Err(invalid("expected a matcher")),
            None => Err(invalid("expected a matcher, found end of expression")),
        }
    };

    let left = term(&mut tokens)?;

    let combine: fn(Arc<dyn Matcher>, Arc<dyn Matcher>) -> Arc<dyn Matcher> = match tokens.next() {
        None => return Ok(left),
        Some(Token::And) => |l, r| Arc::new(And::new(l, r)),
        Some(Token::Or) => |l, r| Arc::new(Or::new(l, r)),
        Some(_) => return Err(invalid("expected AND or OR between matchers")),
    };

    let right = term(&mut tokens)?;

    match tokens.next() {
        None => Ok(combine(left, right)),
        Some(Token::And | Token::Or) => Err(ConfigError::MatcherTooComplex(spec.to_string())),
        Some(_) => Err(invalid("unexpected input after expression")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeSet;

    use mailflow_common::{Content, Mail, MailAddress};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::matcher::{All, HostIs, RecipientIs};

    fn build(name: &str, condition: Option<&str>) -> Result<Arc<dyn Matcher>, ConfigError> {
        match name {
            "All" => Ok(Arc::new(All)),
            "HostIs" => Ok(Arc::new(HostIs::from_condition(condition)?)),
            "RecipientIs" => Ok(Arc::new(RecipientIs::from_condition(condition)?)),
            other => Err(ConfigError::UnknownMatcher(other.to_string())),
        }
    }

    fn addr(s: &str) -> MailAddress {
        s.parse().unwrap()
    }

    fn mail() -> Mail {
        Mail::new(
            None,
            [addr("a@x.com"), addr("b@y.com"), addr("c@x.com")],
            Content::default(),
        )
    }

    fn matched(spec: &str) -> BTreeSet<MailAddress> {
        parse(spec, build).unwrap().match_mail(&mail()).unwrap()
    }

    #[test]
    fn test_tokenize_joins_atom_words() {
        assert_eq!(
            tokenize("NOT RecipientIs=a@x, b@y OR All"),
            vec![
                Token::Not,
                Token::Atom("RecipientIs=a@x, b@y".to_string()),
                Token::Or,
                Token::Atom("All".to_string()),
            ]
        );
    }

    #[test]
    fn test_single_atom() {
        assert_eq!(matched("HostIs=x.com"), BTreeSet::from([addr("a@x.com"), addr("c@x.com")]));
        assert_eq!(matched("All").len(), 3);
    }

    #[test]
    fn test_negated_atom() {
        assert_eq!(matched("NOT HostIs=x.com"), BTreeSet::from([addr("b@y.com")]));
    }

    #[test]
    fn test_binary_expressions() {
        assert_eq!(
            matched("HostIs=x.com AND NOT RecipientIs=a@x.com"),
            BTreeSet::from([addr("c@x.com")])
        );
        assert_eq!(
            matched("RecipientIs=a@x.com OR HostIs=y.com"),
            BTreeSet::from([addr("a@x.com"), addr("b@y.com")])
        );
        assert_eq!(
            parse("NOT All OR HostIs=y.com", build).unwrap().name(),
            "NOT All OR HostIs=y.com"
        );
    }

    #[test]
    fn test_deeper_nesting_is_rejected() {
        let err = parse("All AND All OR All", build).unwrap_err();
        assert!(matches!(err, ConfigError::MatcherTooComplex(_)));
    }

    #[test]
    fn test_malformed_expressions() {
        for spec in ["", "AND All", "All AND", "NOT", "NOT NOT All", "All NOT All"] {
            let err = parse(spec, build).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidMatcher { .. }),
                "{spec:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_unknown_matcher_is_reported() {
        let err = parse("All OR Bogus=1", build).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMatcher(name) if name == "Bogus"));
    }
}
