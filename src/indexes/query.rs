use tantivy::query::{BooleanQuery, Query, QueryParser, RegexQuery, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::tokenizer::TokenizerManager;
use tantivy::{Index, Term};

use super::schema::DocFields;

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    Invalid(String),
}

/// Parse a user query string against one index.
///
/// The engine's query parser handles terms, phrases, `AND`/`OR`/`NOT`,
/// `+`/`-` and field-qualified terms. Regex terms delimited `/re/` are not
/// part of its grammar, so they are split off first and rejoined with the
/// parsed remainder as `should` clauses.
pub fn parse(index: &Index, fields: &DocFields, input: &str) -> Result<Box<dyn Query>, QueryError> {
    let (remainder, patterns) = split_regex_literals(input);
    let mut clauses: Vec<Box<dyn Query>> = Vec::new();

    let remainder = remainder.trim();
    if !remainder.is_empty() {
        let parser = QueryParser::for_index(index, vec![fields.content]);
        clauses.push(
            parser
                .parse_query(remainder)
                .map_err(|err| QueryError::Invalid(err.to_string()))?,
        );
    }
    for pattern in &patterns {
        clauses.push(Box::new(
            RegexQuery::from_pattern(pattern, fields.content)
                .map_err(|err| QueryError::Invalid(err.to_string()))?,
        ));
    }

    if clauses.len() == 1 {
        return Ok(clauses.remove(0));
    }
    if clauses.is_empty() {
        return Err(QueryError::Invalid("empty query".to_owned()));
    }
    Ok(Box::new(BooleanQuery::union(clauses)))
}

/// Check a query string without touching any index. Runs before fan-out so a
/// malformed query fails once instead of per group.
pub fn validate(input: &str) -> Result<(), QueryError> {
    let fields = DocFields::new();
    let (remainder, patterns) = split_regex_literals(input);

    let remainder = remainder.trim();
    if remainder.is_empty() && patterns.is_empty() {
        return Err(QueryError::Invalid("empty query".to_owned()));
    }
    if !remainder.is_empty() {
        detached_parser(&fields)
            .parse_query(remainder)
            .map_err(|err| QueryError::Invalid(err.to_string()))?;
    }
    for pattern in &patterns {
        RegexQuery::from_pattern(pattern, fields.content)
            .map_err(|err| QueryError::Invalid(err.to_string()))?;
    }
    Ok(())
}

/// Collect the terms a query would match, for hit highlighting.
///
/// Boolean nodes contribute the terms of all their clauses, must-not ones
/// included (exclusion is irrelevant for display); phrases contribute each
/// word. Regex literals are returned verbatim in `/re/` form.
pub fn extract_terms(input: &str) -> Result<Vec<String>, QueryError> {
    let fields = DocFields::new();
    let (remainder, patterns) = split_regex_literals(input);
    let mut terms: Vec<String> = Vec::new();

    let remainder = remainder.trim();
    if !remainder.is_empty() {
        let parsed = detached_parser(&fields)
            .parse_query(remainder)
            .map_err(|err| QueryError::Invalid(err.to_string()))?;
        parsed.query_terms(&mut |term: &Term, _| {
            if let Some(text) = term.value().as_str() {
                if !terms.iter().any(|t| t == text) {
                    terms.push(text.to_owned());
                }
            }
        });
    }
    for pattern in patterns {
        RegexQuery::from_pattern(&pattern, fields.content)
            .map_err(|err| QueryError::Invalid(err.to_string()))?;
        terms.push(format!("/{pattern}/"));
    }
    Ok(terms)
}

/// A disjunction of exact `dir` terms: matches documents sitting directly in
/// any of the given directories.
pub fn dir_restriction(fields: &DocFields, dirs: &[String]) -> BooleanQuery {
    let clauses = dirs
        .iter()
        .map(|dir| {
            Box::new(TermQuery::new(
                Term::from_field_text(fields.dir, dir),
                IndexRecordOption::Basic,
            )) as Box<dyn Query>
        })
        .collect::<Vec<_>>();
    BooleanQuery::union(clauses)
}

/// The composite query run per index group: the user query AND the directory
/// disjunction.
pub fn restricted(user: Box<dyn Query>, fields: &DocFields, dirs: &[String]) -> BooleanQuery {
    BooleanQuery::intersection(vec![user, Box::new(dir_restriction(fields, dirs))])
}

/// Case-insensitive alternation over extracted terms, for the preview
/// renderer. Plain terms are escaped and word-bounded; `/re/` terms are
/// inlined verbatim.
pub fn highlight_pattern(terms: &[String]) -> Option<regex::Regex> {
    if terms.is_empty() {
        return None;
    }
    let alternatives = terms
        .iter()
        .map(|term| match term
            .strip_prefix('/')
            .and_then(|t| t.strip_suffix('/'))
        {
            Some(raw) if !raw.is_empty() => raw.to_owned(),
            _ => format!(r"\b{}\b", regex::escape(term)),
        })
        .collect::<Vec<_>>();
    regex::RegexBuilder::new(&alternatives.join("|"))
        .case_insensitive(true)
        .build()
        .ok()
}

fn detached_parser(fields: &DocFields) -> QueryParser {
    QueryParser::new(
        fields.schema.clone(),
        vec![fields.content],
        TokenizerManager::default(),
    )
}

/// Split `/re/` literals out of a query string. Literals are recognized at
/// token starts outside of double quotes; `\/` escapes a slash inside one.
/// An unterminated literal is left in place for the parser to judge.
fn split_regex_literals(input: &str) -> (String, Vec<String>) {
    let mut remainder = String::with_capacity(input.len());
    let mut patterns = Vec::new();
    let mut in_quotes = false;
    let mut prev: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                remainder.push(c);
            }
            '/' if !in_quotes && prev.map_or(true, char::is_whitespace) => {
                let mut pattern = String::new();
                let mut escaped = false;
                let mut closed = false;
                for n in chars.by_ref() {
                    if escaped {
                        pattern.push(n);
                        escaped = false;
                        continue;
                    }
                    match n {
                        '\\' => {
                            pattern.push(n);
                            escaped = true;
                        }
                        '/' => {
                            closed = true;
                            break;
                        }
                        _ => pattern.push(n),
                    }
                }
                if closed {
                    patterns.push(pattern);
                    remainder.push(' ');
                } else {
                    remainder.push('/');
                    remainder.push_str(&pattern);
                }
            }
            _ => remainder.push(c),
        }
        prev = Some(c);
    }
    (remainder, patterns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn split_finds_regex_literals_outside_quotes() {
        let (rest, patterns) = split_regex_literals(r#"foo /ba+r/ "a /not/ literal""#);
        assert_eq!(patterns, vec!["ba+r"]);
        assert_eq!(rest.trim(), r#"foo   "a /not/ literal""#.trim());
    }

    #[test]
    fn split_keeps_unterminated_literal() {
        let (rest, patterns) = split_regex_literals("foo /oops");
        assert!(patterns.is_empty());
        assert_eq!(rest, "foo /oops");
    }

    #[test]
    fn extract_terms_covers_signs_phrases_and_regexes() {
        let terms = extract_terms(r#"+foo -bar "baz qux" /quu+x/"#).unwrap();
        let set: BTreeSet<&str> = terms.iter().map(String::as_str).collect();
        assert_eq!(
            set,
            BTreeSet::from(["foo", "bar", "baz", "qux", "/quu+x/"])
        );
    }

    #[test]
    fn extract_terms_deduplicates() {
        let terms = extract_terms("foo OR foo").unwrap();
        assert_eq!(terms, vec!["foo"]);
    }

    #[test]
    fn malformed_query_is_rejected() {
        assert!(matches!(validate("(foo"), Err(QueryError::Invalid(_))));
        assert!(matches!(validate("   "), Err(QueryError::Invalid(_))));
    }

    #[test]
    fn well_formed_queries_validate() {
        validate(r#"foo AND "bar baz""#).unwrap();
        validate("/qu+x/").unwrap();
        validate("+must -not plain").unwrap();
    }

    #[test]
    fn highlight_pattern_bounds_terms_but_not_regexes() {
        let pattern = highlight_pattern(&[
            "foo".to_owned(),
            "3.14".to_owned(),
            "/quu+x/".to_owned(),
        ])
        .unwrap();

        assert!(pattern.is_match("Foo bar"));
        assert!(!pattern.is_match("food"));
        assert!(pattern.is_match("pi is 3.14 here"));
        assert!(!pattern.is_match("3014"));
        assert!(pattern.is_match("quuux"));
    }

    #[test]
    fn highlight_pattern_of_nothing_is_none() {
        assert!(highlight_pattern(&[]).is_none());
    }
}
