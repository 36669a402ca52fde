//! GraphQL document parsing for rule sources and incoming queries.
//!
//! This module turns GraphQL source text into a small, closed AST that the
//! tree builder walks. It covers the executable subset of the language, which
//! is everything a rule source or a client query can contain.
//!
//! # Supported Features
//!
//! - **Operations**: `query`, `mutation`, `subscription`, named or anonymous,
//!   and the `{ ... }` shorthand for an anonymous query
//! - **Variable definitions** with types and default values: `query ($id: ID = 1)`
//! - **Fields** with aliases, arguments, directives and nested selections
//! - **Fragments**: named fragment definitions, fragment spreads and inline
//!   fragments
//! - **Values**: variables, integers, floats, strings (including block strings
//!   and `\u` escapes), booleans, `null`, enum values, lists and objects
//!
//! # Comments
//!
//! GraphQL treats comments as ignored tokens, but rule sources use them to
//! carry JSON annotations. Operations, fields, arguments and object fields
//! therefore keep the last comment that appears between the previous token
//! and their own first token:
//!
//! ```
//! use fieldgate::syntax::{parse, Selection};
//!
//! let doc = parse(r#"
//!     query {
//!         ## {"ACCEPT": ["admin"]}
//!         books
//!     }
//! "#).unwrap();
//!
//! let op = doc.operations().next().unwrap();
//! let Selection::Field(field) = &op.selection_set[0] else { panic!() };
//! assert_eq!(field.comment.as_deref(), Some(r#"{"ACCEPT": ["admin"]}"#));
//! ```

use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char as pchar, digit1, one_of, satisfy},
    combinator::{all_consuming, map, opt, recognize, verify},
    error::{Error as NomError, ErrorKind},
    multi::{many0, many1},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use thiserror::Error;

/// A parsed GraphQL document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub definitions: Vec<Definition>,
}

impl Document {
    /// Returns the operation definitions in source order.
    pub fn operations(&self) -> impl Iterator<Item = &OperationDefinition> {
        self.definitions.iter().filter_map(|def| match def {
            Definition::Operation(op) => Some(op),
            Definition::Fragment(_) => None,
        })
    }

    /// Returns the fragment definitions in source order.
    pub fn fragments(&self) -> impl Iterator<Item = &FragmentDefinition> {
        self.definitions.iter().filter_map(|def| match def {
            Definition::Fragment(fragment) => Some(fragment),
            Definition::Operation(_) => None,
        })
    }
}

impl FromStr for Document {
    type Err = SyntaxError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        parse(source)
    }
}

/// A top-level definition.
#[derive(Debug, Clone, PartialEq)]
pub enum Definition {
    Operation(OperationDefinition),
    Fragment(FragmentDefinition),
}

/// The three GraphQL operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    /// Returns the keyword for this operation type.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationDefinition {
    /// The comment immediately preceding the operation, without the `#`.
    pub comment: Option<String>,
    pub kind: OperationKind,
    pub name: Option<String>,
    pub variables: Vec<VariableDefinition>,
    pub directives: Vec<Directive>,
    pub selection_set: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    pub ty: Type,
    pub default_value: Option<Value>,
}

/// A variable's declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Named(String),
    List(Box<Type>),
    NonNull(Box<Type>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub name: String,
    pub arguments: Vec<Argument>,
}

/// One entry of a selection set.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Field(Field),
    FragmentSpread(FragmentSpread),
    InlineFragment(InlineFragment),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub comment: Option<String>,
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<Argument>,
    pub directives: Vec<Directive>,
    pub selection_set: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub comment: Option<String>,
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FragmentSpread {
    pub name: String,
    pub directives: Vec<Directive>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InlineFragment {
    pub type_condition: Option<String>,
    pub directives: Vec<Directive>,
    pub selection_set: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FragmentDefinition {
    pub name: String,
    pub type_condition: String,
    pub directives: Vec<Directive>,
    pub selection_set: Vec<Selection>,
}

/// An input value.
///
/// Numeric literals keep their source text; converting them is left to the
/// consumer so that out-of-range literals can be reported as such.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Variable(String),
    Int(String),
    Float(String),
    String(String),
    Boolean(bool),
    Null,
    Enum(String),
    List(Vec<Value>),
    Object(Vec<ObjectField>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub comment: Option<String>,
    pub name: String,
    pub value: Value,
}

/// Error type for GraphQL parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("syntax error at line {line}, column {column}: {message}")]
pub struct SyntaxError {
    /// 1-based line of the offending input.
    pub line: usize,
    /// 1-based column of the offending input.
    pub column: usize,
    pub message: String,
}

impl SyntaxError {
    fn at(source: &str, remaining: &str) -> Self {
        let offset = source.len().saturating_sub(remaining.len());
        let consumed = &source[..offset];
        let line = consumed.matches('\n').count() + 1;
        let column = consumed
            .rsplit('\n')
            .next()
            .map_or(0, |last| last.chars().count())
            + 1;
        let message = match remaining.chars().next() {
            None => "unexpected end of input".to_string(),
            Some(_) => {
                let snippet: String = remaining.chars().take(20).collect();
                format!("unexpected input near `{}`", snippet.trim_end())
            }
        };
        Self {
            line,
            column,
            message,
        }
    }
}

/// The deepest nesting of `[` and `{` a document may use.
///
/// Parsing, tree building and validation recurse once per level.
pub const MAX_DEPTH: usize = 64;

/// Parses a GraphQL document.
///
/// # Example
///
/// ```
/// use fieldgate::syntax::{parse, OperationKind};
///
/// let doc = parse("mutation { addBook(title: \"Dune\") { id } }").unwrap();
/// let op = doc.operations().next().unwrap();
/// assert_eq!(op.kind, OperationKind::Mutation);
///
/// assert!(parse("query { books(").is_err());
/// ```
pub fn parse(source: &str) -> Result<Document, SyntaxError> {
    if let Some(offset) = too_deep(source) {
        return Err(SyntaxError {
            message: format!("nesting deeper than {MAX_DEPTH} levels"),
            ..SyntaxError::at(source, &source[offset..])
        });
    }
    match all_consuming(document)(source) {
        Ok((_, doc)) => Ok(doc),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(SyntaxError::at(source, e.input)),
        Err(nom::Err::Incomplete(_)) => Err(SyntaxError::at(source, "")),
    }
}

// ============================================================================
// Lexical helpers
// ============================================================================

/// Returns the offset of the first bracket opening past [`MAX_DEPTH`],
/// skipping strings and comments.
fn too_deep(source: &str) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'#' => {
                while i < bytes.len() && !matches!(bytes[i], b'\n' | b'\r') {
                    i += 1;
                }
                continue;
            }
            b'"' if source[i..].starts_with("\"\"\"") => {
                // Unterminated block strings are left to the parser to report.
                let end = block_string_end(&source[i + 3..])?;
                i += end + 6;
                continue;
            }
            b'"' => {
                i += 1;
                while i < bytes.len() && !matches!(bytes[i], b'"' | b'\n' | b'\r') {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'[' | b'{' => {
                depth += 1;
                if depth > MAX_DEPTH {
                    return Some(i);
                }
            }
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }
    None
}

fn fail<T>(input: &str) -> IResult<&str, T> {
    Err(nom::Err::Error(NomError::new(input, ErrorKind::Verify)))
}

fn is_insignificant(c: char) -> bool {
    c.is_whitespace() || c == ',' || c == '\u{feff}'
}

fn comment(input: &str) -> IResult<&str, &str> {
    preceded(pchar('#'), take_while(|c: char| c != '\n' && c != '\r'))(input)
}

/// Skips ignored tokens, returning the last comment among them.
fn ignored(input: &str) -> IResult<&str, Option<&str>> {
    let (input, pieces) = many0(alt((
        map(take_while1(is_insignificant), |_| None::<&str>),
        map(comment, Some),
    )))(input)?;
    Ok((input, pieces.into_iter().flatten().last()))
}

fn punct<'a>(c: char) -> impl FnMut(&'a str) -> IResult<&'a str, char> {
    preceded(ignored, pchar(c))
}

fn name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c == '_' || c.is_ascii_alphabetic()),
        take_while(|c: char| c == '_' || c.is_ascii_alphanumeric()),
    ))(input)
}

fn token_name(input: &str) -> IResult<&str, &str> {
    preceded(ignored, name)(input)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    verify(token_name, move |found: &str| found == word)
}

fn annotation(comment: Option<&str>) -> Option<String> {
    comment.map(|text| text.trim().to_string())
}

// ============================================================================
// Definitions
// ============================================================================

fn document(input: &str) -> IResult<&str, Document> {
    let (input, definitions) = many1(definition)(input)?;
    let (input, _) = ignored(input)?;
    Ok((input, Document { definitions }))
}

fn definition(input: &str) -> IResult<&str, Definition> {
    alt((
        map(fragment_definition, Definition::Fragment),
        map(operation_definition, Definition::Operation),
    ))(input)
}

fn operation_definition(input: &str) -> IResult<&str, OperationDefinition> {
    let (input, comment) = ignored(input)?;

    // Shorthand form: an anonymous query with nothing but a selection set.
    if let Ok((rest, selection_set)) = selection_set(input) {
        return Ok((
            rest,
            OperationDefinition {
                comment: annotation(comment),
                kind: OperationKind::Query,
                name: None,
                variables: Vec::new(),
                directives: Vec::new(),
                selection_set,
            },
        ));
    }

    let (input, kind) = operation_kind(input)?;
    let (input, name) = opt(token_name)(input)?;
    let (input, variables) = opt(variable_definitions)(input)?;
    let (input, directives) = directives(input)?;
    let (input, selection_set) = selection_set(input)?;
    Ok((
        input,
        OperationDefinition {
            comment: annotation(comment),
            kind,
            name: name.map(str::to_string),
            variables: variables.unwrap_or_default(),
            directives,
            selection_set,
        },
    ))
}

fn operation_kind(input: &str) -> IResult<&str, OperationKind> {
    let (rest, word) = name(input)?;
    let kind = match word {
        "query" => OperationKind::Query,
        "mutation" => OperationKind::Mutation,
        "subscription" => OperationKind::Subscription,
        _ => return fail(input),
    };
    Ok((rest, kind))
}

fn fragment_definition(input: &str) -> IResult<&str, FragmentDefinition> {
    let (input, _) = keyword("fragment")(input)?;
    let (input, name) = verify(token_name, |found: &str| found != "on")(input)?;
    let (input, _) = keyword("on")(input)?;
    let (input, type_condition) = token_name(input)?;
    let (input, directives) = directives(input)?;
    let (input, selection_set) = selection_set(input)?;
    Ok((
        input,
        FragmentDefinition {
            name: name.to_string(),
            type_condition: type_condition.to_string(),
            directives,
            selection_set,
        },
    ))
}

fn variable_definitions(input: &str) -> IResult<&str, Vec<VariableDefinition>> {
    delimited(punct('('), many1(variable_definition), punct(')'))(input)
}

fn variable_definition(input: &str) -> IResult<&str, VariableDefinition> {
    let (input, name) = preceded(punct('$'), name)(input)?;
    let (input, _) = punct(':')(input)?;
    let (input, ty) = type_ref(input)?;
    let (input, default_value) = opt(preceded(punct('='), value))(input)?;
    let (input, _) = directives(input)?;
    Ok((
        input,
        VariableDefinition {
            name: name.to_string(),
            ty,
            default_value,
        },
    ))
}

fn type_ref(input: &str) -> IResult<&str, Type> {
    let (input, base) = alt((
        map(delimited(punct('['), type_ref, punct(']')), |inner| {
            Type::List(Box::new(inner))
        }),
        map(token_name, |found: &str| Type::Named(found.to_string())),
    ))(input)?;
    let (input, bang) = opt(punct('!'))(input)?;
    let ty = match bang {
        Some(_) => Type::NonNull(Box::new(base)),
        None => base,
    };
    Ok((input, ty))
}

fn directives(input: &str) -> IResult<&str, Vec<Directive>> {
    many0(directive)(input)
}

fn directive(input: &str) -> IResult<&str, Directive> {
    let (input, name) = preceded(punct('@'), name)(input)?;
    let (input, arguments) = opt(arguments)(input)?;
    Ok((
        input,
        Directive {
            name: name.to_string(),
            arguments: arguments.unwrap_or_default(),
        },
    ))
}

// ============================================================================
// Selections
// ============================================================================

fn selection_set(input: &str) -> IResult<&str, Vec<Selection>> {
    delimited(punct('{'), many1(selection), punct('}'))(input)
}

fn selection(input: &str) -> IResult<&str, Selection> {
    alt((fragment_selection, map(field, Selection::Field)))(input)
}

fn fragment_selection(input: &str) -> IResult<&str, Selection> {
    let (input, _) = preceded(ignored, tag("..."))(input)?;
    let (after_name, found) = opt(token_name)(input)?;
    match found {
        Some("on") => {
            let (input, type_condition) = token_name(after_name)?;
            let (input, directives) = directives(input)?;
            let (input, selection_set) = selection_set(input)?;
            Ok((
                input,
                Selection::InlineFragment(InlineFragment {
                    type_condition: Some(type_condition.to_string()),
                    directives,
                    selection_set,
                }),
            ))
        }
        Some(name) => {
            let (input, directives) = directives(after_name)?;
            Ok((
                input,
                Selection::FragmentSpread(FragmentSpread {
                    name: name.to_string(),
                    directives,
                }),
            ))
        }
        None => {
            let (input, directives) = directives(input)?;
            let (input, selection_set) = selection_set(input)?;
            Ok((
                input,
                Selection::InlineFragment(InlineFragment {
                    type_condition: None,
                    directives,
                    selection_set,
                }),
            ))
        }
    }
}

fn field(input: &str) -> IResult<&str, Field> {
    let (input, comment) = ignored(input)?;
    let (input, first) = name(input)?;
    let (input, second) = opt(preceded(punct(':'), token_name))(input)?;
    let (alias, name) = match second {
        Some(name) => (Some(first.to_string()), name),
        None => (None, first),
    };
    let (input, arguments) = opt(arguments)(input)?;
    let (input, directives) = directives(input)?;
    let (input, selection_set) = opt(selection_set)(input)?;
    Ok((
        input,
        Field {
            comment: annotation(comment),
            alias,
            name: name.to_string(),
            arguments: arguments.unwrap_or_default(),
            directives,
            selection_set: selection_set.unwrap_or_default(),
        },
    ))
}

fn arguments(input: &str) -> IResult<&str, Vec<Argument>> {
    delimited(punct('('), many1(argument), punct(')'))(input)
}

fn argument(input: &str) -> IResult<&str, Argument> {
    let (input, (comment, name, value)) = named_value(input)?;
    Ok((
        input,
        Argument {
            comment,
            name,
            value,
        },
    ))
}

fn object_field(input: &str) -> IResult<&str, ObjectField> {
    let (input, (comment, name, value)) = named_value(input)?;
    Ok((
        input,
        ObjectField {
            comment,
            name,
            value,
        },
    ))
}

/// `name: value` with the comment preceding the name.
fn named_value(input: &str) -> IResult<&str, (Option<String>, String, Value)> {
    let (input, comment) = ignored(input)?;
    let (input, name) = name(input)?;
    let (input, _) = punct(':')(input)?;
    let (input, value) = value(input)?;
    Ok((input, (annotation(comment), name.to_string(), value)))
}

// ============================================================================
// Values
// ============================================================================

fn value(input: &str) -> IResult<&str, Value> {
    let (input, _) = ignored(input)?;
    alt((
        map(preceded(pchar('$'), name), |found: &str| {
            Value::Variable(found.to_string())
        }),
        number,
        map(string_value, Value::String),
        map(delimited(punct('['), many0(value), punct(']')), Value::List),
        map(
            delimited(punct('{'), many0(object_field), punct('}')),
            Value::Object,
        ),
        map(name, |found: &str| match found {
            "true" => Value::Boolean(true),
            "false" => Value::Boolean(false),
            "null" => Value::Null,
            other => Value::Enum(other.to_string()),
        }),
    ))(input)
}

fn number(input: &str) -> IResult<&str, Value> {
    let (rest, raw) = recognize(tuple((
        opt(pchar('-')),
        digit1,
        opt(pair(pchar('.'), digit1)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)?;
    let value = if raw.contains(|c: char| matches!(c, '.' | 'e' | 'E')) {
        Value::Float(raw.to_string())
    } else {
        Value::Int(raw.to_string())
    };
    Ok((rest, value))
}

fn string_value(input: &str) -> IResult<&str, String> {
    if let Some(rest) = input.strip_prefix("\"\"\"") {
        let Some(end) = block_string_end(rest) else {
            return fail(input);
        };
        let raw = rest[..end].replace("\\\"\"\"", "\"\"\"");
        return Ok((&rest[end + 3..], block_string(&raw)));
    }

    let Some(rest) = input.strip_prefix('"') else {
        return fail(input);
    };
    let mut out = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((&rest[i + 1..], out)),
            '\\' => {
                let Some((_, escaped)) = chars.next() else {
                    break;
                };
                match escaped {
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    '/' => out.push('/'),
                    'b' => out.push('\u{8}'),
                    'f' => out.push('\u{c}'),
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    'u' => {
                        let Some((decoded, consumed)) = unicode_escape(&rest[i + 2..]) else {
                            return fail(input);
                        };
                        out.push(decoded);
                        for _ in 0..consumed {
                            chars.next();
                        }
                    }
                    _ => return fail(input),
                }
            }
            '\n' | '\r' => break,
            other => out.push(other),
        }
    }
    fail(input)
}

/// Decodes the hex digits after `\u`, joining a surrogate pair written as
/// two escapes. Returns the character and how many input characters it used.
fn unicode_escape(rest: &str) -> Option<(char, usize)> {
    let hex4 = |digits: Option<&str>| {
        digits
            .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
    };
    let high = hex4(rest.get(..4))?;
    if !(0xD800..0xDC00).contains(&high) {
        return Some((char::from_u32(high)?, 4));
    }
    if !rest.get(4..6).is_some_and(|escape| escape == "\\u") {
        return None;
    }
    let low = hex4(rest.get(6..10)).filter(|low| (0xDC00..0xE000).contains(low))?;
    let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
    Some((char::from_u32(code)?, 10))
}

fn block_string_end(rest: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = rest[from..].find("\"\"\"") {
        let at = from + pos;
        if at > 0 && rest.as_bytes()[at - 1] == b'\\' {
            from = at + 3;
            continue;
        }
        return Some(at);
    }
    None
}

/// Removes the common indentation and surrounding blank lines of a block string.
fn block_string(raw: &str) -> String {
    let lines: Vec<&str> = raw.lines().collect();
    let indent = lines
        .iter()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches(|c: char| c == ' ' || c == '\t').len())
        .min()
        .unwrap_or(0);
    let mut lines: Vec<&str> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| if i == 0 { *line } else { line.get(indent..).unwrap_or("") })
        .collect();
    while lines.first().is_some_and(|line| line.trim().is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
