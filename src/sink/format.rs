//! Record line templates.
//!
//! Templates use `%(field)s` placeholders with optional `-` alignment,
//! width and precision, plus `%%` for a literal percent sign. `created` may
//! also be rendered with `d` (whole seconds) or `f`:
//!
//! ```text
//! %(asctime)s %(levelname)-5s [%(topic)s] %(message)s
//! ```

use std::fmt::Write as _;

use chrono::{DateTime, Local};

use crate::utils::SettingsError;

pub const DEFAULT_FORMAT: &str = "%(message)s";

const ASCTIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Every record is written at this level.
const LEVEL_NAME: &str = "INFO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Message,
    AscTime,
    Created,
    Name,
    LevelName,
    Topic,
    Broker,
}

impl Field {
    fn from_key(key: &str) -> Option<Self> {
        match key {
            "message" => Some(Field::Message),
            "asctime" => Some(Field::AscTime),
            "created" => Some(Field::Created),
            "name" => Some(Field::Name),
            "levelname" => Some(Field::LevelName),
            "topic" => Some(Field::Topic),
            "broker" => Some(Field::Broker),
            _ => None,
        }
    }
}

/// The conversion character closing a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Str,
    /// `d`, only valid for `created`
    Int,
    /// `f`, only valid for `created`
    Float,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder {
    field: Field,
    left_align: bool,
    width: usize,
    precision: Option<usize>,
    conversion: Conversion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Field(Placeholder),
}

/// One message as seen by a sink, before formatting.
#[derive(Debug, Clone)]
pub struct Record<'a> {
    /// `<broker>:<topic filter>` of the owning subscription.
    pub name: &'a str,
    pub broker: &'a str,
    /// Concrete topic the message was published on.
    pub topic: &'a str,
    pub message: &'a str,
    pub created: DateTime<Local>,
}

/// A parsed record template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFormat {
    template: String,
    tokens: Vec<Token>,
}

impl Default for RecordFormat {
    fn default() -> Self {
        Self {
            template: DEFAULT_FORMAT.to_string(),
            tokens: vec![Token::Field(Placeholder {
                field: Field::Message,
                left_align: false,
                width: 0,
                precision: None,
                conversion: Conversion::Str,
            })],
        }
    }
}

impl RecordFormat {
    pub fn parse(template: &str) -> Result<Self, SettingsError> {
        let invalid = || SettingsError::InvalidFormat(template.to_string());
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.peek() {
                Some('%') => {
                    chars.next();
                    literal.push('%');
                }
                Some('(') => {
                    chars.next();
                    let mut key = String::new();
                    loop {
                        match chars.next() {
                            Some(')') => break,
                            Some(k) => key.push(k),
                            None => return Err(invalid()),
                        }
                    }
                    let field = Field::from_key(&key)
                        .ok_or_else(|| SettingsError::UnknownPlaceholder(key.clone()))?;

                    let left_align = chars.next_if_eq(&'-').is_some();
                    let width = take_number(&mut chars).unwrap_or(0);
                    let precision = if chars.next_if_eq(&'.').is_some() {
                        Some(take_number(&mut chars).unwrap_or(0))
                    } else {
                        None
                    };
                    let conversion = match (chars.next(), field) {
                        (Some('s'), _) => Conversion::Str,
                        (Some('d'), Field::Created) => Conversion::Int,
                        (Some('f'), Field::Created) => Conversion::Float,
                        _ => return Err(invalid()),
                    };

                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Field(Placeholder {
                        field,
                        left_align,
                        width,
                        precision,
                        conversion,
                    }));
                }
                _ => literal.push('%'),
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Ok(Self {
            template: template.to_string(),
            tokens,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Renders one record, without the trailing newline.
    pub fn render(&self, record: &Record<'_>) -> String {
        let mut out = String::with_capacity(record.message.len() + 32);
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Field(placeholder) => render_field(&mut out, placeholder, record),
            }
        }
        out
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut digits = String::new();
    while let Some(d) = chars.next_if(char::is_ascii_digit) {
        digits.push(d);
    }
    digits.parse().ok()
}

fn render_field(out: &mut String, placeholder: &Placeholder, record: &Record<'_>) {
    let text = match placeholder.field {
        Field::Created => match placeholder.conversion {
            Conversion::Int => record.created.timestamp().to_string(),
            Conversion::Str | Conversion::Float => {
                let secs = record.created.timestamp_micros() as f64 / 1_000_000.0;
                format!("{:.*}", placeholder.precision.unwrap_or(6), secs)
            }
        },
        Field::Message => record.message.to_string(),
        Field::AscTime => record.created.format(ASCTIME_FORMAT).to_string(),
        Field::Name => record.name.to_string(),
        Field::LevelName => LEVEL_NAME.to_string(),
        Field::Topic => record.topic.to_string(),
        Field::Broker => record.broker.to_string(),
    };
    let value = match (placeholder.field, placeholder.precision) {
        (Field::Created, _) | (_, None) => text,
        (_, Some(max)) => text.chars().take(max).collect(),
    };

    let width = placeholder.width;
    let _ = if placeholder.left_align {
        write!(out, "{value:<width$}")
    } else {
        write!(out, "{value:>width$}")
    };
}
