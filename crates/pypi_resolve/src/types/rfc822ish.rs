// Implementation comes from https://github.com/njsmith/posy/blob/main/src/vocab/rfc822ish.rs
// Licensed under MIT or Apache-2.0

use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Header fields by lowercased name; repeated fields keep every value.
pub type Fields = HashMap<String, Vec<String>>;

/// The header block of a `METADATA` / `PKG-INFO` file.
#[derive(Debug)]
pub struct RFC822ish {
    /// The parsed header fields
    pub fields: Fields,
    /// The message body following the headers, the description in modern files
    pub body: Option<String>,
}

#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Rfc822ishError {
    #[error("failed to parse metadata headers: {0}")]
    Parse(#[from] peg::error::ParseError<peg::str::LineCol>),

    #[error("multiple values for singleton key {0}")]
    DuplicateKey(String),

    #[error("can't find required key {0}")]
    MissingKey(String),
}

// Allegedly, a METADATA file is formatted as an RFC822 email message. That is not
// quite true; the actual format is whatever the Python stdlib module email.parser
// accepts. email.parser is extremely lenient of errors. We try to be a bit more
// strict: lenient of mangled utf-8 and trailing newlines, but we fail on oddities
// like an empty field name or a continuation line at the start of input.
peg::parser! {
    grammar rfc822ish_parser() for str {
        // In real RFC822, only CRLF is legal. email.parser is more lenient.
        rule line_ending()
            = quiet!{"\r\n" / "\r" / "\n"}
              / expected!("end of line")

        rule field_name() -> &'input str
            = quiet!{$(['\x21'..='\x39' | '\x3b'..='\x7e']+)}
              / expected!("field name")

        // email.parser drops any " \t" after the colon, but preserves other
        // whitespace in the field value.
        rule field_separator()
            = ":" [' ' | '\t']*

        rule field_value_piece()
            = [^ '\r' | '\n']*

        rule continuation_line_ending()
            = quiet!{line_ending() [' ' | '\t']} / expected!("continuation line")

        // Continuation lines are not folded; they keep their embedded newlines,
        // matching email.parser. Trailing newlines are discarded.
        rule field_value() -> &'input str
            = $(field_value_piece() ** continuation_line_ending())

        rule field() -> (String, String)
            = n:field_name() field_separator() v:field_value()
                { (n.to_ascii_lowercase(), v.to_owned()) }

        rule fields() -> Vec<(String, String)>
            = field() ** line_ending()

        // Early metadata versions had no body at all; tolerate both.
        rule trailing_body() -> String
            = line_ending() line_ending() b:$([_]*) { b.to_owned() }

        // The extra line_ending() absorbs a stray trailing newline at EOF when
        // there is no body.
        pub rule rfc822ish() -> RFC822ish
            = f:fields() body:(trailing_body()?) line_ending()?
                 {
                     let mut fields = Fields::new();
                     for (name, value) in f {
                         fields.entry(name).or_default().push(value)
                     };
                     RFC822ish { fields, body, }
                 }
    }
}

impl FromStr for RFC822ish {
    type Err = Rfc822ishError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(rfc822ish_parser::rfc822ish(input)?)
    }
}

impl RFC822ish {
    /// Remove and return all values of a (case-insensitive) key.
    pub fn take_all(&mut self, key: &str) -> Vec<String> {
        self.fields.remove(&key.to_ascii_lowercase()).unwrap_or_default()
    }

    /// Remove and return the value of a singleton key, `None` if absent.
    pub fn maybe_take(&mut self, key: &str) -> Result<Option<String>, Rfc822ishError> {
        let mut values = self.take_all(key);
        match values.len() {
            0 => Ok(None),
            1 => Ok(values.pop()),
            _ => Err(Rfc822ishError::DuplicateKey(key.to_owned())),
        }
    }

    /// Remove and return the value of a required singleton key.
    pub fn take(&mut self, key: &str) -> Result<String, Rfc822ishError> {
        match self.maybe_take(key)? {
            Some(result) => Ok(result),
            None => Err(Rfc822ishError::MissingKey(key.to_owned())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_basic_metadata() {
        let input = "Metadata-Version: 2.1\nName: trio\nVersion: 0.18.0\nRequires-Dist: attrs >= 19.2.0\nRequires-Dist: sortedcontainers\n\nThe description body\n";
        let mut parsed = RFC822ish::from_str(input).unwrap();
        assert_eq!(parsed.take("Name").unwrap(), "trio");
        assert_eq!(
            parsed.take_all("Requires-Dist"),
            vec!["attrs >= 19.2.0", "sortedcontainers"]
        );
        assert_eq!(parsed.body.as_deref(), Some("The description body\n"));
    }

    #[test]
    fn test_continuation_and_duplicates() {
        let input = "Name: spam\nSummary: a value\n that continues\nName: eggs\n";
        let mut parsed = RFC822ish::from_str(input).unwrap();
        assert_eq!(parsed.take("Summary").unwrap(), "a value\n that continues");
        assert!(matches!(
            parsed.maybe_take("Name"),
            Err(Rfc822ishError::DuplicateKey(_))
        ));
    }
}
