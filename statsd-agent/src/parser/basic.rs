use statsd_util::MetricKind;

use super::{
    is_member_char, is_name_char, is_tag_value_char, metric_kind, Datagram, DatagramBuilder,
    DatagramParser, ParseError,
};

/// A hand-rolled statement scanner.
///
/// Walks each statement once, splitting on delimiters as it goes, and checks numbers with a small
/// state machine instead of a regular expression.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicParser;

impl DatagramParser for BasicParser {
    fn parse_statement(&self, statement: &str) -> Result<Datagram, ParseError> {
        let mut scanner = Scanner::new(statement);

        let name = scanner.until(b':').ok_or(ParseError::MalformedName)?;
        if name.is_empty() || !name.chars().all(is_name_char) {
            return Err(ParseError::MalformedName);
        }

        let value = scanner.until(b'|').ok_or(ParseError::UnknownType)?;
        let kind = metric_kind(scanner.field())?;

        let (numeric, member) = match kind {
            MetricKind::Set => (false, !value.is_empty() && value.chars().all(is_member_char)),
            _ => (is_number(value), false),
        };
        let mut builder = DatagramBuilder::new(name, kind, value, numeric, member)?;

        while let Some(section) = scanner.next_section() {
            let mut chars = section.chars();
            match chars.next() {
                Some('@') => {
                    let rate = chars.as_str();
                    builder.sample_rate(rate, is_number(rate))?;
                }
                Some('#') => {
                    builder.begin_tags()?;
                    for tag in chars.as_str().split(',') {
                        let (key, value) = match tag.split_once(':') {
                            Some((key, value)) => (key, Some(value)),
                            None => (tag, None),
                        };

                        let key_ok = !key.is_empty() && key.chars().all(is_name_char);
                        let value_ok = value.map_or(true, |v| v.chars().all(is_tag_value_char));
                        if !key_ok || !value_ok {
                            return Err(ParseError::MalformedTags);
                        }
                        builder.tag(key, value);
                    }
                }
                _ => return Err(ParseError::UnknownSection),
            }
        }

        Ok(builder.build())
    }
}

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
    done: bool,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0, done: false }
    }

    /// Consumes up to and including the next `delim`, returning what came before it.
    ///
    /// Returns `None`, consuming nothing, if `delim` does not occur in the rest of the input.
    fn until(&mut self, delim: u8) -> Option<&'a str> {
        let rest = &self.input.as_bytes()[self.pos..];
        let offset = rest.iter().position(|b| *b == delim)?;
        let field = &self.input[self.pos..self.pos + offset];
        self.pos += offset + 1;
        Some(field)
    }

    /// Consumes the current `|`-delimited field.
    fn field(&mut self) -> &'a str {
        match self.until(b'|') {
            Some(field) => field,
            None => {
                self.done = true;
                let field = &self.input[self.pos..];
                self.pos = self.input.len();
                field
            }
        }
    }

    /// Consumes the next section, if the statement has any left.
    fn next_section(&mut self) -> Option<&'a str> {
        if self.done {
            None
        } else {
            Some(self.field())
        }
    }
}

/// Checks `[+-]?(digits[.digits*] | .digits)([eE][+-]?digits)?`.
fn is_number(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut pos = 0;

    let skip_sign = |pos: &mut usize| {
        if matches!(bytes.get(*pos), Some(b'+' | b'-')) {
            *pos += 1;
        }
    };
    let skip_digits = |pos: &mut usize| {
        let start = *pos;
        while bytes.get(*pos).is_some_and(u8::is_ascii_digit) {
            *pos += 1;
        }
        *pos - start
    };

    skip_sign(&mut pos);
    let mut digits = skip_digits(&mut pos);
    if bytes.get(pos) == Some(&b'.') {
        pos += 1;
        digits += skip_digits(&mut pos);
    }
    if digits == 0 {
        return false;
    }

    if matches!(bytes.get(pos), Some(b'e' | b'E')) {
        pos += 1;
        skip_sign(&mut pos);
        if skip_digits(&mut pos) == 0 {
            return false;
        }
    }

    pos == bytes.len()
}
