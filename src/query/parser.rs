//! Query Parser
//!
//! Parses the tag/search query language into a [`Query`] AST.
//!
//! # Supported Syntax
//!
//! ```text
//! term (term ...)                     -- conjunction of filter terms
//!
//! id:3,5,9          id:-1             -- explicit stream ID set
//! tag:x  service:x  mark:x  generated:x  -- references to other tags
//! time:2021-01-01T00:00:00Z..2021-02-01T00:00:00Z   -- absolute window
//! rtime:-3600..0                      -- seconds relative to reference time
//! cdata:regex  sdata:regex            -- client/server data conditions
//! cdata.http:regex                    -- data condition on converter output
//! -sdata:regex                        -- inverted data condition
//! sq@cdata:"user=(?P<u>\w+)"          -- term belongs to sub-query `sq`
//! cdata:"hello ${sq.u}"               -- variable from sub-query capture
//! sdata:"pass=${u}"                   -- variable captured earlier in-stream
//! sort:id  sort:-id  limit:10  group:key
//! ```
//!
//! Consecutive non-inverted data terms of one part form a single ordered
//! sequence condition; every inverted data term is its own single-element
//! inverted condition.

use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::char,
    combinator::{map, opt},
    sequence::{preceded, terminated},
    IResult,
};

use crate::query::ast::*;
use crate::query::error::{QueryError, QueryResult};
use chrono::{DateTime, Utc};

/// Parse a query string into a [`Query`].
pub fn parse_query(input: &str) -> QueryResult<Query> {
    let mut query = Query {
        conditions: Conditions::default(),
        reference_time: Utc::now(),
        grouping: None,
        sorting: Sorting::id_ascending(),
        limit: None,
    };
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(QueryError::Parse("empty query".to_string()));
    }
    while !rest.is_empty() {
        let (remaining, term) = parse_term(rest)
            .map_err(|_| QueryError::Parse(format!("malformed term at '{}'", truncate(rest))))?;
        apply_term(&mut query, term)?;
        rest = remaining.trim_start();
    }
    if query.conditions.parts.is_empty() {
        return Err(QueryError::Parse("query has no filters".to_string()));
    }
    Ok(query)
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(32) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// One tokenized term before keyword dispatch.
struct RawTerm<'a> {
    sub_query: Option<&'a str>,
    inverted: bool,
    key: &'a str,
    converter: Option<&'a str>,
    val: String,
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

/// A double-quoted value. `\"` and `\\` unescape; any other backslash
/// sequence passes through untouched so regex escapes survive.
fn quoted_value(input: &str) -> IResult<&str, String> {
    if !input.starts_with('"') {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Char,
        )));
    }
    let mut out = String::new();
    let mut escaped = false;
    for (idx, c) in input.char_indices().skip(1) {
        if escaped {
            match c {
                '"' => out.push('"'),
                '\\' => out.push('\\'),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Ok((&input[idx + 1..], out));
        } else {
            out.push(c);
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}

fn bare_value(input: &str) -> IResult<&str, String> {
    map(take_while1(|c: char| !c.is_whitespace()), str::to_string)(input)
}

fn parse_term(input: &str) -> IResult<&str, RawTerm<'_>> {
    let (input, sub_query) = opt(terminated(identifier, char('@')))(input)?;
    let (input, inverted) = opt(char('-'))(input)?;
    let (input, key) = identifier(input)?;
    let (input, converter) = opt(preceded(char('.'), identifier))(input)?;
    let (input, _) = char(':')(input)?;
    let (input, val) = alt((quoted_value, bare_value))(input)?;
    Ok((
        input,
        RawTerm {
            sub_query,
            inverted: inverted.is_some(),
            key,
            converter,
            val,
        },
    ))
}

fn apply_term(query: &mut Query, term: RawTerm<'_>) -> QueryResult<()> {
    let is_data = matches!(term.key, "cdata" | "sdata");
    if term.converter.is_some() && !is_data {
        return Err(QueryError::Parse(format!(
            "'{}' does not take a converter suffix",
            term.key
        )));
    }
    if term.inverted && !is_data {
        return Err(QueryError::Parse(format!(
            "only data terms can be inverted, '{}' cannot",
            term.key
        )));
    }
    let part_name = term.sub_query.unwrap_or(MAIN_PART);
    match term.key {
        "id" => {
            let ids = parse_id_list(&term.val)?;
            part_mut(&mut query.conditions, part_name)
                .filters
                .push(Filter::Id(ids));
        }
        "tag" | "service" | "mark" | "generated" => {
            if term.val.is_empty() {
                return Err(QueryError::Parse(format!("'{}' needs a tag name", term.key)));
            }
            part_mut(&mut query.conditions, part_name)
                .filters
                .push(Filter::Tag(referenced_tag_name(term.key, &term.val)));
        }
        "time" => {
            let (from, to) = parse_time_window(&term.val)?;
            part_mut(&mut query.conditions, part_name)
                .filters
                .push(Filter::TimeAbsolute { from, to });
        }
        "rtime" => {
            let (from, to) = parse_relative_window(&term.val)?;
            part_mut(&mut query.conditions, part_name)
                .filters
                .push(Filter::TimeRelative { from, to });
        }
        "cdata" | "sdata" => {
            let direction = if term.key == "cdata" {
                Direction::ClientToServer
            } else {
                Direction::ServerToClient
            };
            let (regex, variables) = extract_variables(&term.val, part_name);
            let element = DataElement {
                converter_name: term.converter.unwrap_or("").to_string(),
                regex,
                variables,
                direction,
            };
            let part = part_mut(&mut query.conditions, part_name);
            if term.inverted {
                part.data_conditions.push(DataCondition {
                    elements: vec![element],
                    inverted: true,
                });
            } else if let Some(seq) = part
                .data_conditions
                .iter_mut()
                .find(|c| !c.inverted)
            {
                seq.elements.push(element);
            } else {
                part.data_conditions.push(DataCondition {
                    elements: vec![element],
                    inverted: false,
                });
            }
        }
        "sort" => {
            if term.sub_query.is_some() {
                return Err(QueryError::Parse("'sort' cannot be scoped".to_string()));
            }
            query.sorting = match term.val.as_str() {
                "id" => vec![Sorting {
                    key: SortingKey::Id,
                    dir: SortingDir::Ascending,
                }],
                "-id" => vec![Sorting {
                    key: SortingKey::Id,
                    dir: SortingDir::Descending,
                }],
                other => {
                    return Err(QueryError::Parse(format!("unknown sort key '{other}'")));
                }
            };
        }
        "limit" => {
            if term.sub_query.is_some() {
                return Err(QueryError::Parse("'limit' cannot be scoped".to_string()));
            }
            let n = term
                .val
                .parse::<usize>()
                .map_err(|_| QueryError::Parse(format!("invalid limit '{}'", term.val)))?;
            query.limit = Some(n);
        }
        "group" => {
            if term.sub_query.is_some() {
                return Err(QueryError::Parse("'group' cannot be scoped".to_string()));
            }
            query.grouping = Some(Grouping {
                key: term.val.clone(),
            });
        }
        other => {
            return Err(QueryError::Parse(format!("unknown filter '{other}'")));
        }
    }
    Ok(())
}

fn part_mut<'a>(conditions: &'a mut Conditions, name: &str) -> &'a mut QueryPart {
    if let Some(pos) = conditions.parts.iter().position(|(n, _)| n == name) {
        return &mut conditions.parts[pos].1;
    }
    conditions
        .parts
        .push((name.to_string(), QueryPart::default()));
    let last = conditions.parts.len() - 1;
    &mut conditions.parts[last].1
}

fn parse_id_list(val: &str) -> QueryResult<Vec<u64>> {
    if val == "-1" {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for piece in val.split(',') {
        let id = piece
            .parse::<u64>()
            .map_err(|_| QueryError::InvalidStreamId(piece.to_string()))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn parse_time_window(val: &str) -> QueryResult<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    let (from, to) = split_window(val)?;
    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| QueryError::InvalidTime(format!("{s}: {e}")))
    };
    Ok((
        from.map(parse).transpose()?,
        to.map(parse).transpose()?,
    ))
}

fn parse_relative_window(val: &str) -> QueryResult<(Option<i64>, Option<i64>)> {
    let (from, to) = split_window(val)?;
    let parse = |s: &str| {
        s.parse::<i64>()
            .map_err(|_| QueryError::InvalidTime(s.to_string()))
    };
    Ok((
        from.map(parse).transpose()?,
        to.map(parse).transpose()?,
    ))
}

fn split_window(val: &str) -> QueryResult<(Option<&str>, Option<&str>)> {
    let (from, to) = val
        .split_once("..")
        .ok_or_else(|| QueryError::InvalidTime(format!("'{val}' is missing '..'")))?;
    fn none_if_empty(s: &str) -> Option<&str> {
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }
    Ok((none_if_empty(from), none_if_empty(to)))
}

/// Strip `${name}` and `${sub.name}` references from a data regex,
/// recording each as a [`Variable`] positioned in the stripped text.
///
/// A reference naming the current part resolves to a local variable.
fn extract_variables(raw: &str, part_name: &str) -> (String, Vec<Variable>) {
    let mut stripped = String::with_capacity(raw.len());
    let mut variables = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        stripped.push_str(&rest[..start]);
        let reference = &rest[start + 2..start + end];
        let (sub_query, name) = match reference.split_once('.') {
            Some((sq, name)) if sq != part_name => (sq.to_string(), name.to_string()),
            Some((_, name)) => (String::new(), name.to_string()),
            None => (String::new(), reference.to_string()),
        };
        variables.push(Variable {
            name,
            sub_query,
            position: stripped.len(),
        });
        rest = &rest[start + end + 1..];
    }
    stripped.push_str(rest);
    (stripped, variables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_query() {
        let query = parse_query("id:3,5,9").unwrap();
        let ids = query.conditions.stream_ids(10).unwrap();
        assert_eq!(ids.iter_ones().collect::<Vec<_>>(), vec![3, 5, 9]);

        let query = parse_query("id:-1").unwrap();
        assert!(query.conditions.stream_ids(10).unwrap().is_zero());

        assert!(parse_query("id:3,x").is_err());
    }

    #[test]
    fn test_parse_tag_references() {
        let query = parse_query("tag:a service:http").unwrap();
        let features = query.conditions.features();
        assert_eq!(features.main_tags, vec!["tag/a", "service/http"]);
        assert!(features.sub_query_tags.is_empty());
    }

    #[test]
    fn test_parse_data_sequence() {
        let query = parse_query(r#"cdata:"user=(?P<u>\w+)" sdata:"pass=${u}""#).unwrap();
        let main = query.conditions.main().unwrap();
        assert_eq!(main.data_conditions.len(), 1);
        let condition = &main.data_conditions[0];
        assert!(!condition.inverted);
        assert_eq!(condition.elements.len(), 2);
        assert_eq!(condition.elements[0].direction, Direction::ClientToServer);
        assert_eq!(condition.elements[0].regex, r"user=(?P<u>\w+)");
        assert!(condition.elements[0].variables.is_empty());
        assert_eq!(condition.elements[1].regex, "pass=");
        assert_eq!(
            condition.elements[1].variables,
            vec![Variable {
                name: "u".to_string(),
                sub_query: String::new(),
                position: 5,
            }]
        );
    }

    #[test]
    fn test_parse_inverted_data() {
        let query = parse_query(r#"-sdata:"^ERROR""#).unwrap();
        let main = query.conditions.main().unwrap();
        assert_eq!(main.data_conditions.len(), 1);
        assert!(main.data_conditions[0].inverted);

        // inversion only applies to data terms
        assert!(parse_query("-id:3").is_err());
    }

    #[test]
    fn test_parse_sub_query_parts() {
        let query =
            parse_query(r#"sq@cdata:"user=(?P<u>\w+)" cdata:"hello ${sq.u}""#).unwrap();
        let names: Vec<_> = query.conditions.parts.iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(names, vec!["sq".to_string(), MAIN_PART.to_string()]);
        let main = query.conditions.main().unwrap();
        let variable = &main.data_conditions[0].elements[0].variables[0];
        assert_eq!(variable.sub_query, "sq");
        assert_eq!(variable.name, "u");
        // the reference is stripped from the stored regex
        assert_eq!(main.data_conditions[0].elements[0].regex, "hello ");
    }

    #[test]
    fn test_parse_converter_suffix() {
        let query = parse_query("cdata.http:token").unwrap();
        let main = query.conditions.main().unwrap();
        assert_eq!(main.data_conditions[0].elements[0].converter_name, "http");

        assert!(parse_query("id.http:3").is_err());
    }

    #[test]
    fn test_parse_modifiers() {
        let query = parse_query("id:1 sort:-id limit:20 group:service").unwrap();
        assert_eq!(query.sorting[0].dir, SortingDir::Descending);
        assert_eq!(query.limit, Some(20));
        assert_eq!(query.grouping.as_ref().unwrap().key, "service");
    }

    #[test]
    fn test_parse_time_windows() {
        let query =
            parse_query("time:2021-01-01T00:00:00Z..2021-02-01T00:00:00Z rtime:-3600..").unwrap();
        let main = query.conditions.main().unwrap();
        assert_eq!(main.filters.len(), 2);
        match &main.filters[0] {
            Filter::TimeAbsolute { from, to } => {
                assert!(from.is_some() && to.is_some());
            }
            other => panic!("expected absolute time filter, got {other:?}"),
        }
        match &main.filters[1] {
            Filter::TimeRelative { from, to } => {
                assert_eq!(*from, Some(-3600));
                assert!(to.is_none());
            }
            other => panic!("expected relative time filter, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_query("").is_err());
        assert!(parse_query("frobnicate:1").is_err());
        assert!(parse_query("id").is_err());
    }

    #[test]
    fn test_extract_variables_positions() {
        let (stripped, variables) = extract_variables("a=${x} b=${sq.y}", MAIN_PART);
        assert_eq!(stripped, "a= b=");
        assert_eq!(variables.len(), 2);
        assert_eq!((variables[0].position, variables[0].sub_query.as_str()), (2, ""));
        assert_eq!((variables[1].position, variables[1].sub_query.as_str()), (5, "sq"));
    }
}
