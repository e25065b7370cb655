//! Pluggable archive directory layout and filename templating.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Tokens available to both directory-layout and filename templates.
pub struct LayoutTokens<'a> {
    pub server: &'a str,
    pub database: &'a str,
    pub when: DateTime<Utc>,
    pub kind: &'a str,
}

impl<'a> LayoutTokens<'a> {
    fn month_name(&self) -> &'static str {
        const NAMES: [&str; 12] = [
            "january", "february", "march", "april", "may", "june", "july", "august",
            "september", "october", "november", "december",
        ];
        NAMES[(self.when.month0() as usize).min(11)]
    }

    fn expand(&self, token: &str) -> Option<String> {
        Some(match token {
            "server" => sanitize(self.server),
            "database" => sanitize(self.database),
            "year" => format!("{:04}", self.when.year()),
            "month" => format!("{:02}", self.when.month()),
            "monthname" => self.month_name().to_string(),
            "day" => format!("{:02}", self.when.day()),
            "hour" => format!("{:02}", self.when.hour()),
            "type" => sanitize(self.kind),
            _ => return None,
        })
    }
}

/// Removes characters that are invalid in a path component on common
/// filesystems, so a token never escapes its directory segment.
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

#[derive(Debug, Clone)]
pub enum LayoutStrategy {
    ServerDate,
    DateServer,
    FlatServer,
    Template(String),
}

impl LayoutStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "server/date" => LayoutStrategy::ServerDate,
            "date/server" => LayoutStrategy::DateServer,
            "flat-server" => LayoutStrategy::FlatServer,
            other => LayoutStrategy::Template(other.to_string()),
        }
    }

    pub fn resolve(&self, tokens: &LayoutTokens) -> PathBuf {
        match self {
            LayoutStrategy::ServerDate => Path::new(&sanitize(tokens.server))
                .join(format!("{:04}", tokens.when.year()))
                .join(format!("{:02}", tokens.when.month()))
                .join(format!("{:02}", tokens.when.day())),
            LayoutStrategy::DateServer => Path::new(&format!("{:04}", tokens.when.year()))
                .join(format!("{:02}", tokens.when.month()))
                .join(format!("{:02}", tokens.when.day()))
                .join(sanitize(tokens.server)),
            LayoutStrategy::FlatServer => PathBuf::from(sanitize(tokens.server)),
            LayoutStrategy::Template(template) => PathBuf::from(render_template(template, tokens)),
        }
    }
}

/// Substitutes `{token}` placeholders. Unknown tokens are left untouched.
pub fn render_template(template: &str, tokens: &LayoutTokens) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let token = &template[i + 1..i + end];
                match tokens.expand(token) {
                    Some(value) => {
                        out.push_str(&value);
                        i += end + 1;
                        continue;
                    }
                    None => {
                        out.push_str(&template[i..i + end + 1]);
                        i += end + 1;
                        continue;
                    }
                }
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize("db/../name"), "db_.._name");
    }

    #[test]
    fn server_date_strategy_is_nested() {
        let when = Utc.with_ymd_and_hms(2026, 7, 30, 12, 0, 0).unwrap();
        let tokens = LayoutTokens {
            server: "host1",
            database: "app",
            when,
            kind: "full",
        };
        let path = LayoutStrategy::ServerDate.resolve(&tokens);
        assert_eq!(path, PathBuf::from("host1/2026/07/30"));
    }

    #[test]
    fn template_expands_known_tokens_and_preserves_unknown() {
        let when = Utc.with_ymd_and_hms(2026, 7, 30, 9, 0, 0).unwrap();
        let tokens = LayoutTokens {
            server: "host1",
            database: "app",
            when,
            kind: "full",
        };
        let rendered = render_template("{database}-{year}{month}{day}-{nope}.zip", &tokens);
        assert_eq!(rendered, "app-20260730-{nope}.zip");
    }
}
