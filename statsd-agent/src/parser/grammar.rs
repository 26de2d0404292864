use std::sync::OnceLock;

use regex::Regex;
use statsd_util::MetricKind;

use super::{metric_kind, Datagram, DatagramBuilder, DatagramParser, ParseError};

// Productions of the statement grammar. Character classes mirror `is_name_char`,
// `is_tag_value_char` and `is_member_char`: `\s` is Unicode White_Space and `\p{Cc}` is the control
// category, as with `char::is_whitespace` and `char::is_control`.
const STATEMENT: &str = r"^(?s)(?P<name>[^:]*):(?P<value>[^|]*)(?:\|(?P<type>[^|]*))?(?P<sections>.*)$";
const NAME: &str = r"^[^\s\p{Cc}:|@#,=]+$";
const TYPE: &str = r"^(?:c|g|ms|h|s)$";
const NUMBER: &str = r"^[+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:[eE][+-]?[0-9]+)?$";
const MEMBER: &str = r"^[^\s\p{Cc}|]+$";
const SECTION: &str = r"\|(?P<body>[^|]*)";
const TAGS: &str = r"^(?:[^\s\p{Cc}:|@#,=]+(?::[^\s\p{Cc},|]*)?)(?:,[^\s\p{Cc}:|@#,=]+(?::[^\s\p{Cc},|]*)?)*$";
const TAG: &str = r"^(?P<key>[^:]+)(?::(?P<value>.*))?$";

struct Grammar {
    statement: Regex,
    name: Regex,
    ty: Regex,
    number: Regex,
    member: Regex,
    section: Regex,
    tags: Regex,
    tag: Regex,
}

impl Grammar {
    fn compile() -> Self {
        let compile = |pattern: &str| Regex::new(pattern).expect("statement grammar must compile");

        Grammar {
            statement: compile(STATEMENT),
            name: compile(NAME),
            ty: compile(TYPE),
            number: compile(NUMBER),
            member: compile(MEMBER),
            section: compile(SECTION),
            tags: compile(TAGS),
            tag: compile(TAG),
        }
    }
}

static GRAMMAR: OnceLock<Grammar> = OnceLock::new();

/// A grammar-driven statement parser.
///
/// Each production of the statement grammar is a compiled regular expression. The productions are
/// compiled once per process and shared by every `GrammarParser`.
#[derive(Clone, Copy)]
pub struct GrammarParser {
    grammar: &'static Grammar,
}

impl GrammarParser {
    /// Creates a new `GrammarParser`, compiling the grammar if needed.
    pub fn new() -> Self {
        Self { grammar: GRAMMAR.get_or_init(Grammar::compile) }
    }
}

impl Default for GrammarParser {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GrammarParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammarParser").finish_non_exhaustive()
    }
}

impl DatagramParser for GrammarParser {
    fn parse_statement(&self, statement: &str) -> Result<Datagram, ParseError> {
        let g = self.grammar;

        let caps = g.statement.captures(statement).ok_or(ParseError::MalformedName)?;
        let field = |group: &str| caps.name(group).map(|m| m.as_str());

        let name = field("name").unwrap_or_default();
        if !g.name.is_match(name) {
            return Err(ParseError::MalformedName);
        }

        let ty = field("type").ok_or(ParseError::UnknownType)?;
        if !g.ty.is_match(ty) {
            return Err(ParseError::UnknownType);
        }
        let kind = metric_kind(ty)?;

        let value = field("value").unwrap_or_default();
        let (numeric, member) = match kind {
            MetricKind::Set => (false, g.member.is_match(value)),
            _ => (g.number.is_match(value), false),
        };
        let mut builder = DatagramBuilder::new(name, kind, value, numeric, member)?;

        let sections = field("sections").unwrap_or_default();
        for section in g.section.captures_iter(sections) {
            let body = section.name("body").map_or("", |m| m.as_str());
            if let Some(rate) = body.strip_prefix('@') {
                builder.sample_rate(rate, g.number.is_match(rate))?;
            } else if let Some(tags) = body.strip_prefix('#') {
                builder.begin_tags()?;
                if !g.tags.is_match(tags) {
                    return Err(ParseError::MalformedTags);
                }
                for tag in tags.split(',') {
                    let tag = g.tag.captures(tag).ok_or(ParseError::MalformedTags)?;
                    let key = tag.name("key").map_or("", |m| m.as_str());
                    builder.tag(key, tag.name("value").map(|m| m.as_str()));
                }
            } else {
                return Err(ParseError::UnknownSection);
            }
        }

        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::GrammarParser;
    use crate::parser::{DatagramParser, ParseError};

    #[test]
    fn grammar_is_shared() {
        let a = GrammarParser::new();
        let b = GrammarParser::default();
        assert!(std::ptr::eq(a.grammar, b.grammar));
    }

    #[test]
    fn tag_values_may_contain_colons() {
        let datagram =
            GrammarParser::new().parse_statement("req:1|c|#route:/a:b").expect("valid statement");
        let tag = &datagram.tags()[0];
        assert_eq!(tag.key(), "route");
        assert_eq!(tag.value(), "/a:b");
    }

    #[test]
    fn section_before_type_is_the_type() {
        // The first field after the value is always the type token.
        let result = GrammarParser::new().parse_statement("req:1|@0.5|c");
        assert_eq!(result, Err(ParseError::UnknownType));
    }
}
