//! Output path templates such as `/srv/rec/{now:%Y-%m-%d}/cam-{sequence:04}.mkv`.

use std::fmt::{self, Write as _};
use std::path::PathBuf;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};

use crate::error::{Error, Result};

const DEFAULT_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Now(String),
    Sequence { width: usize },
}

/// Parsed path template.
///
/// Placeholders: `{now}`, `{now:<strftime>}`, `{sequence}`, `{sequence:<width>}`
/// (zero padded). `{{` and `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPattern {
    source: String,
    segments: Vec<Segment>,
}

impl TargetPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let fail = |reason: &str| Error::Pattern {
            pattern: pattern.to_owned(),
            reason: reason.to_owned(),
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(fail("unmatched '}'")),
                '{' => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => field.push(c),
                            None => return Err(fail("unclosed '{'")),
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_field(&field).map_err(|reason| fail(&reason))?);
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if !segments.iter().any(|s| !matches!(s, Segment::Literal(_))) {
            return Err(fail("needs a {now} or {sequence} placeholder so files are not overwritten"));
        }

        Ok(Self {
            source: pattern.to_owned(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn render<Tz>(&self, now: &DateTime<Tz>, sequence: u64) -> PathBuf
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let mut out = String::new();
        for segment in &self.segments {
            // Formats were validated in parse, writing to a String cannot fail
            let _ = match segment {
                Segment::Literal(text) => write!(out, "{text}"),
                Segment::Now(format) => write!(out, "{}", now.format(format)),
                Segment::Sequence { width } => {
                    let width = *width;
                    write!(out, "{sequence:0width$}")
                }
            };
        }
        PathBuf::from(out)
    }
}

fn parse_field(field: &str) -> std::result::Result<Segment, String> {
    let (name, spec) = match field.split_once(':') {
        Some((name, spec)) => (name.trim(), Some(spec)),
        None => (field.trim(), None),
    };
    match name {
        "now" => {
            let format = spec.unwrap_or(DEFAULT_TIME_FORMAT);
            if format.is_empty() {
                return Err("empty time format".into());
            }
            if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                return Err(format!("invalid time format '{format}'"));
            }
            Ok(Segment::Now(format.to_owned()))
        }
        "sequence" => {
            let width = match spec.map(|s| s.trim().trim_end_matches('d')) {
                None | Some("") => 0,
                Some(digits) => digits
                    .parse::<usize>()
                    .map_err(|_| format!("invalid sequence width '{digits}'"))?,
            };
            Ok(Segment::Sequence { width })
        }
        other => Err(format!("unknown placeholder '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone as _};

    use super::*;

    fn at() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
            .unwrap()
    }

    #[test]
    fn renders_time_and_sequence() {
        let pattern = TargetPattern::parse("/rec/{now:%Y-%m-%d}/cam-{now:%H%M%S}-{sequence:04}.mkv").unwrap();
        assert_eq!(
            pattern.render(&at(), 7),
            PathBuf::from("/rec/2024-03-09/cam-070501-0007.mkv")
        );
    }

    #[test]
    fn default_formats() {
        let pattern = TargetPattern::parse("{now}_{sequence}.ts").unwrap();
        assert_eq!(pattern.render(&at(), 12), PathBuf::from("20240309070501_12.ts"));
    }

    #[test]
    fn printf_style_width_and_escapes() {
        let pattern = TargetPattern::parse("{{x}}-{sequence:03d}").unwrap();
        assert_eq!(pattern.render(&at(), 5), PathBuf::from("{x}-005"));
    }

    #[test]
    fn rejects_malformed_patterns() {
        for bad in [
            "/rec/{now",
            "/rec/now}",
            "/rec/{camera}.mkv",
            "/rec/{sequence:abc}.mkv",
            "/rec/{now:%Q}.mkv",
            "/rec/{now:}.mkv",
            "/rec/static.mkv",
        ] {
            assert!(
                matches!(TargetPattern::parse(bad), Err(Error::Pattern { .. })),
                "accepted {bad}"
            );
        }
    }
}
