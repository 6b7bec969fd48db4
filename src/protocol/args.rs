//! Argument-format template parsing.
//!
//! A template is split into tokens: a token is a maximal run of non-space
//! characters, where a double-quoted segment keeps its spaces and its quotes
//! and stays glued to adjacent characters (`-Name"value with spaces"` is one
//! token). If the first token begins with `-` the whole template is in
//! named-parameter mode; otherwise every token is a positional argument.

use std::collections::BTreeMap;

use crate::error::ProtocolError;

/// Parsed shape of an argument-format template. Named and positional modes
/// are mutually exclusive — the first token decides for the whole template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedArguments {
    Positional(Vec<String>),
    Named(BTreeMap<String, String>),
}

/// Parses a non-empty argument-format template.
///
/// Named mode: each `-flag` token opens a pending parameter with an empty
/// default; the next non-flag token fills it. A value with no pending
/// parameter name is a format error.
pub fn parse_argument_format(format: &str) -> Result<ParsedArguments, ProtocolError> {
    let tokens = tokenize(format);
    let named = tokens
        .first()
        .map(|token| token.starts_with('-'))
        .unwrap_or(false);
    if !named {
        return Ok(ParsedArguments::Positional(tokens));
    }

    let mut parameters = BTreeMap::new();
    let mut pending: Option<String> = None;
    for token in tokens {
        if token.starts_with('-') {
            let name = token.trim_start_matches('-').to_string();
            parameters.insert(name.clone(), String::new());
            pending = Some(name);
        } else if let Some(name) = pending.take() {
            parameters.insert(name, token);
        } else {
            return Err(ProtocolError::ArgumentFormat(format!(
                "found value {token:?} with no preceding named parameter"
            )));
        }
    }
    Ok(ParsedArguments::Named(parameters))
}

/// Splits a template on spaces, keeping double-quoted segments (and their
/// quotes) inside the surrounding token.
fn tokenize(format: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in format.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push('"');
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
