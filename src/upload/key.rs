// src/upload/key.rs

//! Object key derivation. Pure: the same task, finish time and file always
//! produce the same key, so a retried or repeated upload overwrites rather
//! than duplicates.

use std::path::Path;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyContext<'a> {
    pub request_id: &'a str,
    pub task_id: &'a str,
    pub finished_at: DateTime<Utc>,
}

const NAMED_TOKENS: [&str; 5] = ["requestId", "taskId", "filename", "filebase", "fileext"];

/// Render `pattern` for `file`. Unknown `%` sequences are kept verbatim.
pub fn render_key(pattern: &str, ctx: &KeyContext<'_>, file: &Path) -> String {
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (filebase, fileext) = split_name(&filename);

    let mut out = String::with_capacity(pattern.len() + filename.len());
    let mut rest = pattern;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];

        if let Some(token) = NAMED_TOKENS.iter().find(|t| after.starts_with(**t)) {
            match *token {
                "requestId" => out.push_str(ctx.request_id),
                "taskId" => out.push_str(ctx.task_id),
                "filename" => out.push_str(&filename),
                "filebase" => out.push_str(filebase),
                _ => out.push_str(fileext),
            }
            rest = &after[token.len()..];
            continue;
        }

        let mut chars = after.chars();
        match chars.next() {
            Some(c @ ('Y' | 'm' | 'd' | 'H' | 'M' | 'S')) => {
                out.push_str(&ctx.finished_at.format(&format!("%{c}")).to_string());
                rest = chars.as_str();
            }
            Some('s') => {
                out.push_str(&ctx.finished_at.timestamp().to_string());
                rest = chars.as_str();
            }
            Some('%') => {
                out.push('%');
                rest = chars.as_str();
            }
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);

    out.trim_start_matches('/').to_string()
}

fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx + 1..]),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ctx() -> KeyContext<'static> {
        KeyContext {
            request_id: "web",
            task_id: "web-1",
            finished_at: Utc
                .with_ymd_and_hms(2024, 3, 7, 9, 5, 1)
                .single()
                .expect("valid time"),
        }
    }

    #[test]
    fn default_pattern() {
        let key = render_key(
            "%requestId/%Y/%m/%taskId/%filename",
            &ctx(),
            Path::new("/tasks/web-1/logs/service.log-1"),
        );
        assert_eq!(key, "web/2024/03/web-1/service.log-1");
    }

    #[test]
    fn base_ext_and_time_tokens() {
        let key = render_key(
            "%filebase-%d%H%M%S.%fileext/%s/100%%",
            &ctx(),
            Path::new("gc.log"),
        );
        assert_eq!(key, format!("gc-07090501.log/{}/100%", ctx().finished_at.timestamp()));
    }

    #[test]
    fn unknown_tokens_and_dotfiles() {
        assert_eq!(render_key("%q/%filebase", &ctx(), Path::new(".env")), "%q/.env");
        assert_eq!(render_key("x/%", &ctx(), Path::new("a")), "x/%");
    }

    proptest! {
        #[test]
        fn rendering_is_pure(
            pattern in "[a-z/%YmdHMSs]{0,24}(%filename)?",
            name in "[a-z]{1,8}(\\.[a-z]{1,3})?",
        ) {
            let file = Path::new("/tasks/t").join(&name);
            let first = render_key(&pattern, &ctx(), &file);
            let second = render_key(&pattern, &ctx(), &file);
            prop_assert_eq!(first, second);
        }
    }
}
