//! Statsd datagram parsing.
//!
//! A datagram carries one or more newline-separated statements of the form:
//!
//! ```text
//! name:value|type[|@sample_rate][|#tag1:value1,tag2,...]
//! ```
//!
//! Two strategies are provided: [`BasicParser`], a hand-rolled scanner, and [`GrammarParser`], which
//! matches each production of the grammar with a compiled regular expression. Both classify every
//! input identically, so the strategy can be swapped without any observable change in behavior.
//!
//! Classification happens in a fixed order, and the first failing step determines the error:
//!
//! 1. the name (everything up to the first `:`) must be present, non-empty, and free of whitespace,
//!    control characters and the delimiters `: | @ # , =` ([`ParseError::MalformedName`])
//! 2. the type token following the first `|` must be one of `c`, `g`, `ms`, `h` or `s`
//!    ([`ParseError::UnknownType`])
//! 3. the value must fit the type ([`ParseError::MalformedValue`])
//! 4. the remaining sections are checked left to right: `@rate` ([`ParseError::InvalidSampleRate`]),
//!    `#tags` ([`ParseError::MalformedTags`]), anything else, or a repeated section
//!    ([`ParseError::UnknownSection`])
use std::str;

use statsd_util::{MetricKey, MetricKind, Tag};
use thiserror::Error;

mod basic;
pub use self::basic::BasicParser;

mod grammar;
pub use self::grammar::GrammarParser;

/// Errors that could occur while parsing a datagram.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The datagram is larger than the maximum datagram size, and was not parsed at all.
    #[error("datagram of {len} bytes exceeds the maximum of {max} bytes")]
    TooLarge {
        /// Length of the datagram, in bytes.
        len: usize,

        /// Maximum datagram size, in bytes.
        max: usize,
    },

    /// The statement is not valid UTF-8.
    #[error("statement is not valid UTF-8")]
    InvalidEncoding,

    /// The metric name is missing, empty, or contains reserved characters.
    #[error("metric name is missing or malformed")]
    MalformedName,

    /// The type token is missing or not a known metric type.
    #[error("metric type is missing or unknown")]
    UnknownType,

    /// The value does not fit the metric type.
    #[error("metric value is malformed")]
    MalformedValue,

    /// The sample rate is not a number in `(0, 1]`.
    #[error("sample rate must be a number in (0, 1]")]
    InvalidSampleRate,

    /// The tag section is empty or contains a malformed tag.
    #[error("tags are malformed")]
    MalformedTags,

    /// A section is empty, repeated, or of an unknown kind.
    #[error("unknown, empty or repeated section")]
    UnknownSection,
}

impl ParseError {
    /// Number of distinct parse error kinds.
    pub const KINDS: usize = 8;

    /// Labels of every parse error kind, ordered by [`index`](ParseError::index).
    pub const LABELS: [&'static str; Self::KINDS] = [
        "too_large",
        "invalid_encoding",
        "malformed_name",
        "unknown_type",
        "malformed_value",
        "invalid_sample_rate",
        "malformed_tags",
        "unknown_section",
    ];

    /// Dense index of this error kind, for per-kind accounting.
    pub const fn index(&self) -> usize {
        match self {
            ParseError::TooLarge { .. } => 0,
            ParseError::InvalidEncoding => 1,
            ParseError::MalformedName => 2,
            ParseError::UnknownType => 3,
            ParseError::MalformedValue => 4,
            ParseError::InvalidSampleRate => 5,
            ParseError::MalformedTags => 6,
            ParseError::UnknownSection => 7,
        }
    }

    /// Short, stable label for this error kind.
    pub const fn label(&self) -> &'static str {
        Self::LABELS[self.index()]
    }
}

/// A gauge update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GaugeValue {
    /// Sets the gauge to the given value.
    Absolute(f64),

    /// Adjusts the gauge up by the given magnitude. Written with a leading `+`.
    Increment(f64),

    /// Adjusts the gauge down by the given magnitude. Written with a leading `-`.
    Decrement(f64),
}

/// The value of a datagram, by metric type.
#[derive(Clone, Debug, PartialEq)]
pub enum DatagramValue {
    /// Counter increment. Finite and non-negative.
    Counter(f64),

    /// Gauge update.
    Gauge(GaugeValue),

    /// Timer observation. Finite and non-negative.
    Timer(f64),

    /// Set member.
    Set(String),
}

impl DatagramValue {
    /// Kind of metric this value updates.
    pub fn kind(&self) -> MetricKind {
        match self {
            DatagramValue::Counter(_) => MetricKind::Counter,
            DatagramValue::Gauge(_) => MetricKind::Gauge,
            DatagramValue::Timer(_) => MetricKind::Timer,
            DatagramValue::Set(_) => MetricKind::Set,
        }
    }
}

/// A single parsed statsd statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Datagram {
    name: String,
    value: DatagramValue,
    sample_rate: f64,
    tags: Vec<Tag>,
}

impl Datagram {
    /// Metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metric value.
    pub fn value(&self) -> &DatagramValue {
        &self.value
    }

    /// Sample rate, in `(0, 1]`. Defaults to `1.0`.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Tags, in the order they were written.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Kind of metric this datagram updates.
    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Consumes the datagram, returning the metric key it updates, its value and its sample rate.
    pub fn into_parts(self) -> (MetricKey, DatagramValue, f64) {
        (MetricKey::new(self.name, self.tags), self.value, self.sample_rate)
    }
}

/// A datagram parsing strategy.
///
/// Implementations only need to parse a single statement; splitting a datagram into statements,
/// size checks and UTF-8 validation are shared by every strategy through [`parse`].
///
/// [`parse`]: DatagramParser::parse
pub trait DatagramParser: Clone + Send + 'static {
    /// Parses a single statement, without its trailing newline.
    ///
    /// # Errors
    ///
    /// If the statement is malformed, an error describing the first violated rule is returned.
    fn parse_statement(&self, statement: &str) -> Result<Datagram, ParseError>;

    /// Parses a datagram into its statements.
    ///
    /// Statements are separated by newlines, and empty lines are skipped. Each statement is parsed
    /// independently when the returned iterator is advanced, so a malformed statement never affects
    /// the others.
    ///
    /// # Errors
    ///
    /// If `buf` is longer than `max_len`, [`ParseError::TooLarge`] is returned and nothing is
    /// parsed.
    fn parse<'a>(&'a self, buf: &'a [u8], max_len: usize) -> Result<Statements<'a, Self>, ParseError>
    where
        Self: Sized,
    {
        if buf.len() > max_len {
            return Err(ParseError::TooLarge { len: buf.len(), max: max_len });
        }

        Ok(Statements { parser: self, lines: buf.split(is_newline as fn(&u8) -> bool) })
    }
}

fn is_newline(b: &u8) -> bool {
    *b == b'\n'
}

/// Iterator over the statements of a datagram.
///
/// Created by [`DatagramParser::parse`].
pub struct Statements<'a, P> {
    parser: &'a P,
    lines: std::slice::Split<'a, u8, fn(&u8) -> bool>,
}

impl<'a, P> Iterator for Statements<'a, P>
where
    P: DatagramParser,
{
    type Item = Result<Datagram, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }

            return Some(match str::from_utf8(line) {
                Ok(statement) => self.parser.parse_statement(statement),
                Err(_) => Err(ParseError::InvalidEncoding),
            });
        }
    }
}

/// Which section of a statement has already been seen.
#[derive(Default)]
struct SeenSections {
    rate: bool,
    tags: bool,
}

/// Builds datagrams from the lexical pieces a strategy has recognized.
///
/// Strategies decide what each piece of a statement *looks* like; the builder turns recognized pieces
/// into values, and enforces the semantic rules that are the same for every strategy.
pub(crate) struct DatagramBuilder<'a> {
    name: &'a str,
    value: DatagramValue,
    sample_rate: f64,
    tags: Vec<Tag>,
    seen: SeenSections,
}

impl<'a> DatagramBuilder<'a> {
    /// Starts a datagram from an already validated name, the metric type and the raw value.
    ///
    /// `numeric` tells whether `value` is lexically a number. It is ignored for sets, whose members
    /// are checked by `member`.
    pub fn new(
        name: &'a str,
        kind: MetricKind,
        value: &str,
        numeric: bool,
        member: bool,
    ) -> Result<Self, ParseError> {
        let value = match kind {
            MetricKind::Set if member => DatagramValue::Set(value.to_string()),
            MetricKind::Set => return Err(ParseError::MalformedValue),
            kind => {
                let number = parse_number(value, numeric).ok_or(ParseError::MalformedValue)?;
                match kind {
                    MetricKind::Counter if number >= 0.0 => DatagramValue::Counter(number),
                    MetricKind::Timer if number >= 0.0 => DatagramValue::Timer(number),
                    MetricKind::Gauge => DatagramValue::Gauge(gauge_value(value, number)),
                    _ => return Err(ParseError::MalformedValue),
                }
            }
        };

        Ok(Self { name, value, sample_rate: 1.0, tags: Vec::new(), seen: SeenSections::default() })
    }

    /// Applies a `@rate` section.
    pub fn sample_rate(&mut self, rate: &str, numeric: bool) -> Result<(), ParseError> {
        if std::mem::replace(&mut self.seen.rate, true) {
            return Err(ParseError::UnknownSection);
        }

        match parse_number(rate, numeric) {
            Some(rate) if rate > 0.0 && rate <= 1.0 => {
                self.sample_rate = rate;
                Ok(())
            }
            _ => Err(ParseError::InvalidSampleRate),
        }
    }

    /// Marks the start of a `#tags` section.
    pub fn begin_tags(&mut self) -> Result<(), ParseError> {
        if std::mem::replace(&mut self.seen.tags, true) {
            return Err(ParseError::UnknownSection);
        }
        Ok(())
    }

    /// Adds a validated tag.
    pub fn tag(&mut self, key: &str, value: Option<&str>) {
        self.tags.push(Tag::new(key, value.unwrap_or_default()));
    }

    pub fn build(self) -> Datagram {
        Datagram {
            name: self.name.to_string(),
            value: self.value,
            sample_rate: self.sample_rate,
            tags: self.tags,
        }
    }
}

/// Maps a type token to the metric kind it denotes.
pub(crate) fn metric_kind(token: &str) -> Result<MetricKind, ParseError> {
    match token {
        "c" => Ok(MetricKind::Counter),
        "g" => Ok(MetricKind::Gauge),
        "ms" | "h" => Ok(MetricKind::Timer),
        "s" => Ok(MetricKind::Set),
        _ => Err(ParseError::UnknownType),
    }
}

fn parse_number(text: &str, numeric: bool) -> Option<f64> {
    if !numeric {
        return None;
    }
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn gauge_value(text: &str, number: f64) -> GaugeValue {
    match text.as_bytes().first() {
        Some(b'+') => GaugeValue::Increment(number.abs()),
        Some(b'-') => GaugeValue::Decrement(number.abs()),
        _ => GaugeValue::Absolute(number),
    }
}

/// Whether `c` may appear in a metric name or a tag key.
pub(crate) fn is_name_char(c: char) -> bool {
    !c.is_whitespace() && !c.is_control() && !matches!(c, ':' | '|' | '@' | '#' | ',' | '=')
}

/// Whether `c` may appear in a tag value.
pub(crate) fn is_tag_value_char(c: char) -> bool {
    !c.is_whitespace() && !c.is_control() && !matches!(c, ',' | '|')
}

/// Whether `c` may appear in a set member.
pub(crate) fn is_member_char(c: char) -> bool {
    !c.is_whitespace() && !c.is_control() && c != '|'
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use statsd_util::{MetricKind, Tag};

    use super::{
        BasicParser, Datagram, DatagramParser, DatagramValue, GaugeValue, GrammarParser,
        ParseError,
    };

    fn parse_both(statement: &str) -> Result<Datagram, ParseError> {
        let basic = BasicParser.parse_statement(statement);
        let grammar = GrammarParser::new().parse_statement(statement);
        assert_eq!(basic, grammar, "strategies disagree on {:?}", statement);
        basic
    }

    #[test]
    fn valid_statements() {
        let cases = [
            ("foo:1|c", DatagramValue::Counter(1.0), 1.0, vec![]),
            ("foo:1|c|@0.1", DatagramValue::Counter(1.0), 0.1, vec![]),
            ("foo.bar_baz-1:2.5|g", DatagramValue::Gauge(GaugeValue::Absolute(2.5)), 1.0, vec![]),
            ("foo:+3|g", DatagramValue::Gauge(GaugeValue::Increment(3.0)), 1.0, vec![]),
            ("foo:-3|g", DatagramValue::Gauge(GaugeValue::Decrement(3.0)), 1.0, vec![]),
            ("foo:320|ms", DatagramValue::Timer(320.0), 1.0, vec![]),
            ("foo:.5|h", DatagramValue::Timer(0.5), 1.0, vec![]),
            ("foo:1e3|ms|@1", DatagramValue::Timer(1000.0), 1.0, vec![]),
            ("foo:user-42|s", DatagramValue::Set("user-42".to_string()), 1.0, vec![]),
            (
                "foo:1|c|#host:a,canary",
                DatagramValue::Counter(1.0),
                1.0,
                vec![Tag::new("host", "a"), Tag::bare("canary")],
            ),
            (
                "foo:1|c|#url:http://x|@0.5",
                DatagramValue::Counter(1.0),
                0.5,
                vec![Tag::new("url", "http://x")],
            ),
        ];

        for (input, value, rate, tags) in cases {
            let datagram = parse_both(input).unwrap_or_else(|e| panic!("{}: {}", input, e));
            assert_eq!(datagram.value(), &value, "{}", input);
            assert_eq!(datagram.sample_rate(), rate, "{}", input);
            assert_eq!(datagram.tags(), &tags[..], "{}", input);
        }
    }

    #[test]
    fn classification_order() {
        let cases = [
            ("foo", ParseError::MalformedName),
            (":1|c", ParseError::MalformedName),
            ("fo o:1|c", ParseError::MalformedName),
            ("foo=bar:1|c", ParseError::MalformedName),
            ("fo|o:1|c", ParseError::MalformedName),
            ("foo:1", ParseError::UnknownType),
            ("foo:1|x", ParseError::UnknownType),
            ("foo:1|", ParseError::UnknownType),
            ("foo:abc|x", ParseError::UnknownType),
            ("foo:abc|c", ParseError::MalformedValue),
            ("foo:-1|c", ParseError::MalformedValue),
            ("foo:-1|ms", ParseError::MalformedValue),
            ("foo:1e999|g", ParseError::MalformedValue),
            ("foo:|s", ParseError::MalformedValue),
            ("foo:a b|s", ParseError::MalformedValue),
            ("foo:.|g", ParseError::MalformedValue),
            ("foo:1|c|@0", ParseError::InvalidSampleRate),
            ("foo:1|c|@1.5", ParseError::InvalidSampleRate),
            ("foo:1|c|@", ParseError::InvalidSampleRate),
            ("foo:1|c|@0.5|#bad tag", ParseError::MalformedTags),
            ("foo:1|c|#", ParseError::MalformedTags),
            ("foo:1|c|#a,,b", ParseError::MalformedTags),
            ("foo:1|c|#:v", ParseError::MalformedTags),
            ("foo:1|c|#a|@2", ParseError::InvalidSampleRate),
            ("foo:1|c|@0.5|@0.5", ParseError::UnknownSection),
            ("foo:1|c|#a|#b", ParseError::UnknownSection),
            ("foo:1|c|", ParseError::UnknownSection),
            ("foo:1|c|x", ParseError::UnknownSection),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_both(input), Err(expected), "{}", input);
        }
    }

    #[test]
    fn multi_statement_datagram() {
        let parser = BasicParser;
        let buf = b"a:1|c\nbogus\n\nb:2|g\r\n\xff\xfe:1|c\n";
        let results = parser.parse(buf, 1472).expect("within size limit").collect::<Vec<_>>();

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().map(Datagram::kind), Ok(MetricKind::Counter));
        assert_eq!(results[1], Err(ParseError::MalformedName));
        assert_eq!(results[2].as_ref().map(Datagram::kind), Ok(MetricKind::Gauge));
        assert_eq!(results[3], Err(ParseError::InvalidEncoding));
    }

    #[test]
    fn too_large_is_not_parsed() {
        let parser = GrammarParser::new();
        let buf = [b'a'; 16];
        let result = parser.parse(&buf, 15).map(|_| ());
        assert_eq!(result, Err(ParseError::TooLarge { len: 16, max: 15 }));
        assert!(parser.parse(&buf, 16).is_ok());
    }

    #[test]
    fn error_labels() {
        assert_eq!(ParseError::TooLarge { len: 2, max: 1 }.label(), "too_large");
        assert_eq!(ParseError::UnknownSection.label(), "unknown_section");
        assert_eq!(ParseError::MalformedTags.index(), 6);
    }

    fn arb_statement() -> impl Strategy<Value = String> {
        let name = prop_oneof!["[a-z][a-z0-9._-]{0,8}", ".{0,6}"];
        let value = prop_oneof![
            "[+-]?[0-9]{0,3}(\\.[0-9]{0,2})?([eE][+-]?[0-9]{0,3})?",
            "[a-z0-9 ]{0,4}",
            ".{0,4}",
        ];
        let kind = prop_oneof!["c", "g", "ms", "h", "s", "[a-z]{0,2}"];
        let section = prop_oneof![
            "@[0-9.]{0,4}",
            "@.{0,3}",
            "#([a-z]{0,3}(:[a-z0-9:]{0,3})?)(,[a-z =]{0,3}(:[a-z]{0,2})?){0,2}",
            "#.{0,5}",
            ".{0,3}",
        ];
        let sections = proptest::collection::vec(section, 0..3);

        (name, value, kind, sections, any::<bool>()).prop_map(|(name, value, kind, sections, typed)| {
            let mut statement = format!("{}:{}", name, value);
            if typed {
                statement.push('|');
                statement.push_str(&kind);
            }
            for section in sections {
                statement.push('|');
                statement.push_str(&section);
            }
            statement
        })
    }

    proptest! {
        #[test]
        fn strategies_agree_on_structured_input(statement in arb_statement()) {
            let basic = BasicParser.parse_statement(&statement);
            let grammar = GrammarParser::new().parse_statement(&statement);
            prop_assert_eq!(basic, grammar);
        }

        #[test]
        fn strategies_agree_on_arbitrary_input(statement in ".{0,32}") {
            let basic = BasicParser.parse_statement(&statement);
            let grammar = GrammarParser::new().parse_statement(&statement);
            prop_assert_eq!(basic, grammar);
        }
    }
}
