//! SQL script execution: statement splitting, comment handling, and the
//! `file` include directive.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use tracing::{debug, warn};

use crate::client::{AD_HOC, ProcedureClient};
use crate::error::{Error, Result};

/// Per-statement timeout for non-DDL statements, milliseconds.
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10_000;

/// Include recursion bound for the `file` directive.
const MAX_INCLUDE_DEPTH: usize = 10;

const DDL_KEYWORDS: [&str; 5] = ["create", "alter", "drop", "partition", "dr"];

/// Runs SQL scripts through a connected client.
///
/// Statement mode sends one `@AdHoc` call per complete statement; batch
/// mode sends the whole input in a single call, which the server only
/// accepts when the batch starts with DDL.
pub struct ScriptRunner<'a> {
    client: &'a dyn ProcedureClient,
    batch_timeout_ms: u64,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(client: &'a dyn ProcedureClient) -> Self {
        Self {
            client,
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
        }
    }

    /// Overrides the timeout applied to non-DDL statements.
    #[must_use]
    pub fn with_batch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.batch_timeout_ms = timeout_ms;
        self
    }

    /// Executes a script file statement by statement.
    pub async fn run_file(&self, path: &Path) -> Result<()> {
        let source = read_script(path).await?;
        self.run_source(source, 0).await
    }

    /// Executes script text statement by statement.
    pub async fn run_str(&self, source: &str) -> Result<()> {
        self.run_source(source.to_string(), 0).await
    }

    /// Sends the whole input as one ad-hoc batch.
    ///
    /// The server only accepts batches that begin with DDL, so the
    /// precondition is checked client-side before anything is sent.
    pub async fn run_batch(&self, source: &str) -> Result<()> {
        let (statements, trailing) = split_statements(source);
        let Some(first) = statements.first() else {
            return Err(Error::NonDdlBatch);
        };
        if !is_ddl(first) {
            return Err(Error::NonDdlBatch);
        }
        if statements.iter().any(|s| parse_file_directive(s).is_some()) {
            return Err(Error::Config(
                "file directive is not allowed inside a batch".to_string(),
            ));
        }
        if let Some(rest) = trailing {
            warn!(statement = %rest, "batch ends in an unterminated statement; ignoring it");
        }
        let batch = statements.join("\n");
        let response = self
            .client
            .call(AD_HOC, &[serde_json::Value::String(batch)])
            .await?;
        check_status(response)
    }

    fn run_source(
        &self,
        source: String,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if depth > MAX_INCLUDE_DEPTH {
                return Err(Error::Config(format!(
                    "file directives nested deeper than {MAX_INCLUDE_DEPTH}"
                )));
            }
            let (statements, trailing) = split_statements(&source);
            for statement in statements {
                if let Some((path, batch)) = parse_file_directive(&statement) {
                    let included = read_script(Path::new(&path)).await?;
                    if batch {
                        self.run_batch(&included).await?;
                    } else {
                        self.run_source(included, depth + 1).await?;
                    }
                } else {
                    self.execute_statement(&statement).await?;
                }
            }
            if let Some(rest) = trailing {
                warn!(statement = %rest, "script ends in an unterminated statement; ignoring it");
            }
            Ok(())
        })
    }

    async fn execute_statement(&self, statement: &str) -> Result<()> {
        debug!(%statement, "executing");
        let params = [serde_json::Value::String(statement.to_string())];
        let response = if is_ddl(statement) {
            self.client.call(AD_HOC, &params).await?
        } else {
            self.client
                .call_with_timeout(self.batch_timeout_ms, AD_HOC, &params)
                .await?
        };
        check_status(response)
    }
}

async fn read_script(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(Error::ScriptNotFound(path.to_path_buf()));
    }
    Ok(tokio::fs::read_to_string(path).await?)
}

fn check_status(response: crate::client::ProcedureResponse) -> Result<()> {
    if response.status.is_success() {
        Ok(())
    } else {
        Err(Error::Procedure {
            status: response.status,
            message: response.status_string,
        })
    }
}

/// Whether a statement starts with a DDL keyword.
fn is_ddl(statement: &str) -> bool {
    let first = statement.split_whitespace().next().unwrap_or("");
    DDL_KEYWORDS.iter().any(|k| first.eq_ignore_ascii_case(k))
}

/// Parses `file 'path';` and `file -batch 'path';` directives.
fn parse_file_directive(statement: &str) -> Option<(String, bool)> {
    let rest = statement.trim();
    let rest = strip_keyword(rest, "file")?;
    let (rest, batch) = match strip_keyword(rest, "-batch") {
        Some(rest) => (rest, true),
        None => (rest, false),
    };
    let rest = rest.trim();
    let unquoted = rest
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .unwrap_or(rest);
    if unquoted.is_empty() {
        return None;
    }
    Some((unquoted.to_string(), batch))
}

fn strip_keyword<'s>(input: &'s str, keyword: &str) -> Option<&'s str> {
    let head = input.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &input[keyword.len()..];
    if rest.starts_with(char::is_whitespace) || rest.is_empty() {
        Some(rest.trim_start())
    } else {
        None
    }
}

/// Splits script text into complete (semicolon-terminated) statements,
/// quote- and comment-aware. Returns the statements with terminators and
/// surrounding whitespace stripped, plus any unterminated trailing text.
fn split_statements(source: &str) -> (Vec<String>, Option<String>) {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = source.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        if in_single {
            current.push(c);
            if c == '\'' {
                in_single = false;
            }
            continue;
        }
        if in_double {
            current.push(c);
            if c == '"' {
                in_double = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_single = true;
                current.push(c);
            }
            '"' => {
                in_double = true;
                current.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                // Line comment: drop through end of line.
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                current.push('\n');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                current.push(' ');
            }
            ';' => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    let trailing = {
        let rest = current.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    };
    (statements, trailing)
}
