//! Module header parser.
//!
//! Reads just enough of a policy module for linting: the package declaration,
//! the imports and the comment spans. The body is only checked for balanced
//! brackets and terminated strings.

use serde::{Deserialize, Serialize};
use vigil_types::{Diagnostic, LineIndex, Location, Span};

/// Rule id used for diagnostics produced by the parser.
pub const PARSE_ERROR_RULE: &str = "parse-error";

/// Parses source text into a [`ParsedModule`].
pub trait Parser: Send + Sync {
    /// Parses `contents` of the file at `uri`.
    ///
    /// On failure, returns the syntax errors as diagnostics.
    fn parse(&self, uri: &str, contents: &str) -> Result<ParsedModule, Vec<Diagnostic>>;
}

/// An `import` statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRef {
    /// Imported path, e.g. `data.users.admins`.
    pub path: String,
    /// Optional `as` alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Span of the path.
    pub span: Span,
    /// Editor location of the path.
    pub loc: Location,
}

/// The parsed header of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModule {
    /// Package path without the `package` keyword, e.g. `authz.rules`.
    pub package: String,
    /// Span of the package path.
    pub package_span: Span,
    /// Import statements in source order.
    pub imports: Vec<ImportRef>,
    /// Spans of comments, including the leading `#`.
    pub comments: Vec<Span>,
}

/// Parser for `.rego` modules.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegoParser;

impl RegoParser {
    /// Creates a new parser.
    pub fn new() -> Self {
        Self
    }
}

impl Parser for RegoParser {
    fn parse(&self, _uri: &str, contents: &str) -> Result<ParsedModule, Vec<Diagnostic>> {
        let index = LineIndex::new(contents);
        let mut errors = Vec::new();

        let scan = scan_tokens(contents);
        for (span, message) in scan.errors {
            errors.push(parse_error(message, span, &index));
        }

        let mut package: Option<(String, Span)> = None;
        let mut imports = Vec::new();
        let mut seen_body = false;

        for (offset, line) in code_lines(contents, &scan.comments) {
            let trimmed = line.trim_start();
            if trimmed.is_empty() {
                continue;
            }
            let start = offset + (line.len() - trimmed.len());
            let trimmed = trimmed.trim_end();

            if let Some(rest) = keyword_rest(trimmed, "package") {
                if package.is_some() {
                    errors.push(parse_error(
                        "unexpected second package declaration",
                        line_span(start, trimmed),
                        &index,
                    ));
                    continue;
                }
                let path_start = start + (trimmed.len() - rest.len());
                let span = line_span(path_start, rest);
                if !is_valid_ref(rest) {
                    errors.push(parse_error(
                        format!("invalid package path `{}`", rest),
                        span,
                        &index,
                    ));
                }
                package = Some((rest.to_string(), span));
                continue;
            }

            if package.is_none() {
                errors.push(parse_error(
                    "expected package declaration",
                    line_span(start, trimmed),
                    &index,
                ));
                // Report the missing package once, at the first statement.
                package = Some((String::new(), Span::default()));
                seen_body = true;
                continue;
            }

            if let Some(rest) = keyword_rest(trimmed, "import") {
                if seen_body {
                    errors.push(parse_error(
                        "imports must precede rules",
                        line_span(start, trimmed),
                        &index,
                    ));
                    continue;
                }
                let path_start = start + (trimmed.len() - rest.len());
                match parse_import(rest) {
                    Some((path, alias)) => {
                        let span = line_span(path_start, path);
                        imports.push(ImportRef {
                            path: path.to_string(),
                            alias: alias.map(str::to_string),
                            span,
                            loc: index.location(span),
                        });
                    }
                    None => errors.push(parse_error(
                        format!("invalid import `{}`", rest),
                        line_span(path_start, rest),
                        &index,
                    )),
                }
                continue;
            }

            seen_body = true;
        }

        if package.is_none() {
            errors.push(parse_error(
                "expected package declaration",
                Span::new(0, 0),
                &index,
            ));
        }

        if !errors.is_empty() {
            Diagnostic::sort_for_display(&mut errors);
            return Err(errors);
        }

        let (package, package_span) = package.unwrap_or_default();
        Ok(ParsedModule {
            package,
            package_span,
            imports,
            comments: scan.comments,
        })
    }
}

fn parse_error(message: impl Into<String>, span: Span, index: &LineIndex<'_>) -> Diagnostic {
    Diagnostic::new(PARSE_ERROR_RULE, message, span, index).with_category("parse")
}

fn line_span(start: usize, text: &str) -> Span {
    Span::new(start as u32, (start + text.len()) as u32)
}

/// Returns the text after `keyword` if `line` starts with it as a whole word.
fn keyword_rest<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    if rest.starts_with(char::is_whitespace) {
        Some(rest.trim_start())
    } else {
        None
    }
}

fn parse_import(rest: &str) -> Option<(&str, Option<&str>)> {
    let mut parts = rest.split_whitespace();
    let path = parts.next()?;
    let alias = match (parts.next(), parts.next(), parts.next()) {
        (None, _, _) => None,
        (Some("as"), Some(alias), None) if is_identifier(alias) => Some(alias),
        _ => return None,
    };
    is_valid_ref(path).then_some((path, alias))
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_valid_ref(path: &str) -> bool {
    !path.is_empty() && path.split('.').all(is_identifier)
}

/// Splits `contents` into lines with comments removed, yielding each line's
/// byte offset.
fn code_lines<'a>(
    contents: &'a str,
    comments: &'a [Span],
) -> impl Iterator<Item = (usize, String)> + 'a {
    let mut offset = 0;
    contents.split_inclusive('\n').map(move |raw| {
        let start = offset;
        offset += raw.len();
        let end = start + raw.trim_end_matches(['\n', '\r']).len();

        let mut line = String::with_capacity(end - start);
        let mut cursor = start;
        for comment in comments {
            let (c_start, c_end) = (comment.start as usize, comment.end as usize);
            if c_end <= cursor || c_start >= end {
                continue;
            }
            line.push_str(&contents[cursor..c_start.max(cursor)]);
            cursor = c_end.min(end);
        }
        if cursor < end {
            line.push_str(&contents[cursor..end]);
        }
        (start, line)
    })
}

#[derive(Debug, Default)]
struct TokenScan {
    comments: Vec<Span>,
    errors: Vec<(Span, String)>,
}

/// Finds comments, and checks strings and brackets, in one pass.
fn scan_tokens(contents: &str) -> TokenScan {
    let mut scan = TokenScan::default();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut chars = contents.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            '#' => {
                let mut end = contents.len();
                while let Some(&(next_offset, next)) = chars.peek() {
                    if next == '\n' {
                        end = next_offset;
                        break;
                    }
                    chars.next();
                }
                let end = contents[offset..end].trim_end_matches('\r').len() + offset;
                scan.comments.push(Span::new(offset as u32, end as u32));
            }
            '"' => {
                let mut closed = false;
                while let Some((_, next)) = chars.next() {
                    match next {
                        '\\' => {
                            chars.next();
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\n' => break,
                        _ => {}
                    }
                }
                if !closed {
                    scan.errors.push((
                        Span::new(offset as u32, offset as u32 + 1),
                        "unterminated string".to_string(),
                    ));
                }
            }
            '`' => {
                if !chars.any(|(_, next)| next == '`') {
                    scan.errors.push((
                        Span::new(offset as u32, offset as u32 + 1),
                        "unterminated raw string".to_string(),
                    ));
                }
            }
            '(' | '[' | '{' => stack.push((c, offset)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_offset)) => {
                        scan.errors.push((
                            Span::new(offset as u32, offset as u32 + 1),
                            format!(
                                "mismatched `{}`, expected closing for `{}` at byte {}",
                                c, open, open_offset
                            ),
                        ));
                    }
                    None => {
                        scan.errors.push((
                            Span::new(offset as u32, offset as u32 + 1),
                            format!("unexpected `{}`", c),
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    for (open, offset) in stack {
        scan.errors.push((
            Span::new(offset as u32, offset as u32 + 1),
            format!("unclosed `{}`", open),
        ));
    }
    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use vigil_types::Position;

    fn parse(text: &str) -> Result<ParsedModule, Vec<Diagnostic>> {
        RegoParser::new().parse("file:///test.rego", text)
    }

    fn error_messages(text: &str) -> Vec<String> {
        parse(text)
            .unwrap_err()
            .into_iter()
            .map(|d| d.message)
            .collect()
    }

    #[test]
    fn test_parse_package_and_imports() {
        let text = "package authz.rules\n\n\
                    import data.users\n\
                    import input.request as req\n\n\
                    allow if { true }\n";
        let module = parse(text).unwrap();
        let package_span = module.package_span;

        assert_eq!(module.package, "authz.rules");
        assert_eq!(
            &text[package_span.start as usize..package_span.end as usize],
            "authz.rules"
        );
        assert_eq!(module.imports.len(), 2);
        assert_eq!(module.imports[0].path, "data.users");
        assert_eq!(module.imports[0].loc.start, Position::new(2, 7));
        assert_eq!(module.imports[1].path, "input.request");
        assert_eq!(module.imports[1].alias.as_deref(), Some("req"));
    }

    #[test]
    fn test_parse_collects_comments() {
        let text = "# header\npackage foo # trailing\nmsg := \"# not a comment\"\n";
        let module = parse(text).unwrap();

        let comments: Vec<&str> = module
            .comments
            .iter()
            .map(|s| &text[s.start as usize..s.end as usize])
            .collect();
        assert_eq!(comments, vec!["# header", "# trailing"]);
        assert_eq!(module.package, "foo");
    }

    #[test]
    fn test_parse_crlf_line_endings() {
        let module = parse("package foo\r\nimport data.bar # why\r\n").unwrap();
        assert_eq!(module.imports[0].path, "data.bar");
        assert_eq!(module.comments.len(), 1);
    }

    #[rstest]
    #[case::empty("", "expected package declaration")]
    #[case::rule_before_package("allow := true\npackage foo\n", "expected package declaration")]
    #[case::bad_package("package foo..bar\n", "invalid package path `foo..bar`")]
    #[case::bad_import("package foo\nimport data.\n", "invalid import `data.`")]
    #[case::import_after_rule("package foo\nallow := true\nimport data.x\n", "imports must precede rules")]
    #[case::second_package("package foo\npackage bar\n", "unexpected second package declaration")]
    #[case::unclosed_brace("package foo\nallow if {\n", "unclosed `{`")]
    #[case::unexpected_paren("package foo\nx := 1)\n", "unexpected `)`")]
    #[case::unterminated_string("package foo\nx := \"abc\n", "unterminated string")]
    fn test_parse_errors(#[case] text: &str, #[case] expected: &str) {
        let messages = error_messages(text);
        assert!(
            messages.iter().any(|m| m == expected),
            "expected {:?} in {:?}",
            expected,
            messages
        );
    }

    #[test]
    fn test_parse_error_diagnostics_are_tagged() {
        let errors = parse("package foo\nallow if {\n").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].rule_id, PARSE_ERROR_RULE);
        assert_eq!(errors[0].category, "parse");
        assert_eq!(errors[0].loc.start, Position::new(1, 9));
    }

    #[test]
    fn test_brackets_inside_strings_and_comments_are_ignored() {
        let text = "package foo\nmsg := \"{[(\" # )]}\nraw := `}\n)`\n";
        assert!(parse(text).is_ok());
    }

    #[test]
    fn test_mismatched_bracket() {
        let messages = error_messages("package foo\nx := [1, 2)\n");
        assert!(messages[0].starts_with("mismatched `)`"));
    }
}
