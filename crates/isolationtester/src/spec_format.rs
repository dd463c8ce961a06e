//! A direct-style reader for the spec-file block syntax (§4.6 of the
//! design notes):
//!
//! ```text
//! setup { SQL-text }
//! teardown { SQL-text }
//!
//! connection "name" { connstring }
//!
//! session "s1"
//! connection "name"
//! setup   { SQL-text }
//! step "s1a"   { SQL-text }
//! teardown { SQL-text }
//!
//! permutation "s1a" "s2a"
//! ```
//!
//! This is not a generated parser: it tokenizes on `{`/`}` block boundaries
//! and quoted identifiers, and is only as forgiving as the fixtures in this
//! crate need it to be. `#` begins a line comment anywhere outside a quoted
//! string or a block.

use crate::spec::{ConnInfo, Permutation, Session, Step, TestSpec};
use anyhow::{bail, Context};

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_trivia(&mut self) {
        loop {
            let rest = self.rest();
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if self.rest().starts_with('#') {
                let end = self.rest().find('\n').unwrap_or(self.rest().len());
                self.pos += end;
                continue;
            }
            break;
        }
    }

    /// Next bare word token (a keyword), or `None` at end of input.
    fn peek_word(&mut self) -> Option<&'a str> {
        self.skip_trivia();
        let rest = self.rest();
        if rest.is_empty() || rest.starts_with('"') || rest.starts_with('{') {
            return None;
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '{' || c == '"')
            .unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        Some(&rest[..end])
    }

    fn take_word(&mut self) -> Option<&'a str> {
        let word = self.peek_word()?;
        self.pos += word.len();
        Some(word)
    }

    /// Expect and consume a quoted `"..."` string, returning its contents.
    fn take_string(&mut self) -> anyhow::Result<String> {
        self.skip_trivia();
        let rest = self.rest();
        if !rest.starts_with('"') {
            bail!("expected a quoted string at byte offset {}", self.pos);
        }
        let mut out = String::new();
        let mut chars = rest[1..].char_indices();
        loop {
            let (idx, c) = chars
                .next()
                .ok_or_else(|| anyhow::anyhow!("unterminated string literal"))?;
            match c {
                '"' => {
                    self.pos += 1 /* opening quote */ + idx + 1 /* closing quote */;
                    return Ok(out);
                }
                '\\' => {
                    let (_, escaped) = chars
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("unterminated escape in string literal"))?;
                    out.push(escaped);
                }
                c => out.push(c),
            }
        }
    }

    /// Expect and consume a `{ ... }` block, returning its trimmed contents.
    /// Brace nesting is tracked so SQL containing `{}` (rare, but legal in
    /// e.g. array literals) round-trips.
    fn take_block(&mut self) -> anyhow::Result<String> {
        self.skip_trivia();
        let rest = self.rest();
        if !rest.starts_with('{') {
            bail!("expected a {{ ... }} block at byte offset {}", self.pos);
        }
        let mut depth = 0usize;
        for (idx, c) in rest.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let content = rest[1..idx].trim().to_string();
                        self.pos += idx + 1;
                        return Ok(content);
                    }
                }
                _ => {}
            }
        }
        bail!("unterminated block starting at byte offset {}", self.pos)
    }
}

/// Parse a spec-file body into a [`TestSpec`]. Connection references are
/// left unresolved (by name); call [`TestSpec::resolve_connections`]
/// afterwards.
pub fn parse(input: &str) -> anyhow::Result<TestSpec> {
    let mut scanner = Scanner::new(input);
    let mut spec = TestSpec::default();
    let mut current_session: Option<Session> = None;

    while let Some(word) = scanner.peek_word() {
        match word {
            "setup" => {
                scanner.take_word();
                let sql = scanner.take_block().context("parsing setup block")?;
                match &mut current_session {
                    Some(session) => session.setup = Some(sql),
                    None => spec.setup.push(sql),
                }
            }
            "teardown" => {
                scanner.take_word();
                let sql = scanner.take_block().context("parsing teardown block")?;
                match &mut current_session {
                    Some(session) => session.teardown = Some(sql),
                    None => spec.teardown.push(sql),
                }
            }
            "connection" => {
                scanner.take_word();
                let name = scanner.take_string().context("parsing connection name")?;
                match &mut current_session {
                    // Inside a session block, `connection "name"` (no
                    // trailing block) references an already-declared
                    // ConnInfo by name.
                    Some(session) if !scanner.rest().trim_start().starts_with('{') => {
                        session.connection = Some(name);
                    }
                    _ => {
                        let connstring = scanner
                            .take_block()
                            .context("parsing connection string block")?;
                        if spec.connections.iter().any(|c| c.name == name) {
                            bail!("duplicate connection name {name:?}");
                        }
                        spec.connections.push(ConnInfo {
                            name,
                            connstring,
                        });
                    }
                }
            }
            "session" => {
                if let Some(session) = current_session.take() {
                    spec.sessions.push(session);
                }
                scanner.take_word();
                let name = scanner.take_string().context("parsing session name")?;
                current_session = Some(Session {
                    name,
                    connection: None,
                    conn_index: 0,
                    setup: None,
                    teardown: None,
                    steps: Vec::new(),
                });
            }
            "step" => {
                scanner.take_word();
                let name = scanner.take_string().context("parsing step name")?;
                let sql = scanner.take_block().context("parsing step body")?;
                let session = current_session
                    .as_mut()
                    .ok_or_else(|| anyhow::anyhow!("step {name:?} declared outside any session"))?;
                session.steps.push(Step {
                    name,
                    session: 0, // patched below once sessions are finalized
                    sql,
                    errormsg: None,
                });
            }
            "permutation" => {
                scanner.take_word();
                let mut steps = Vec::new();
                while scanner.rest().trim_start().starts_with('"') {
                    steps.push(scanner.take_string().context("parsing permutation step")?);
                }
                if steps.is_empty() {
                    bail!("permutation with no steps");
                }
                spec.permutations.push(Permutation { steps });
            }
            other => bail!("unexpected token {other:?} at byte offset {}", scanner.pos),
        }
    }
    if let Some(session) = current_session.take() {
        spec.sessions.push(session);
    }

    let mut seen_steps = std::collections::HashSet::new();
    for (session_idx, session) in spec.sessions.iter_mut().enumerate() {
        for step in &mut session.steps {
            step.session = session_idx;
            if !seen_steps.insert(step.name.clone()) {
                bail!("duplicate step name {:?}", step.name);
            }
        }
    }

    let mut seen_sessions = std::collections::HashSet::new();
    for session in &spec.sessions {
        if !seen_sessions.insert(session.name.clone()) {
            bail!("duplicate session name {:?}", session.name);
        }
    }

    spec.resolve_connections()?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WRITER_READER: &str = r#"
        connection "a" { dbname=postgres }

        session "s1"
        step "w1" { BEGIN; }
        step "w2" { UPDATE t SET v = v + 1 WHERE k = 1; }
        step "w3" { COMMIT; }

        session "s2"
        step "r1" { BEGIN; }
        step "r2" { SELECT v FROM t WHERE k = 1 FOR UPDATE; }
        step "r3" { COMMIT; }

        permutation "w1" "w2" "r1" "r2" "w3" "r3"
        permutation "w1" "w2" "r1" "r2" "r3" "w3"
    "#;

    #[test]
    fn parses_sessions_steps_and_permutations() {
        let spec = parse(WRITER_READER).unwrap();
        assert_eq!(spec.connections.len(), 1);
        assert_eq!(spec.sessions.len(), 2);
        assert_eq!(spec.sessions[0].steps.len(), 3);
        assert_eq!(spec.sessions[0].steps[1].sql, "UPDATE t SET v = v + 1 WHERE k = 1;");
        assert_eq!(spec.permutations.len(), 2);
        assert_eq!(spec.permutations[0].steps, vec!["w1", "w2", "r1", "r2", "w3", "r3"]);
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let spec = r#"
            session "s1"
            step "a" { SELECT 1; }
            step "a" { SELECT 2; }
        "#;
        assert!(parse(spec).is_err());
    }

    #[test]
    fn rejects_undefined_connection_reference() {
        let spec = r#"
            session "s1"
            connection "nope"
            step "a" { SELECT 1; }
        "#;
        assert!(parse(spec).is_err());
    }

    #[test]
    fn session_level_connection_reference_resolves_by_name() {
        let spec = r#"
            connection "primary" { dbname=postgres }
            connection "replica" { dbname=postgres_ro }

            session "s1"
            connection "replica"
            step "a" { SELECT 1; }
        "#;
        let spec = parse(spec).unwrap();
        assert_eq!(spec.sessions[0].conn_index, 1);
    }

    #[test]
    fn global_and_per_session_setup_teardown() {
        let spec = r#"
            setup { CREATE TABLE t (k int, v int); }
            teardown { DROP TABLE t; }

            session "s1"
            setup { BEGIN; }
            step "a" { SELECT 1; }
            teardown { COMMIT; }
        "#;
        let spec = parse(spec).unwrap();
        assert_eq!(spec.setup, vec!["CREATE TABLE t (k int, v int);"]);
        assert_eq!(spec.teardown, vec!["DROP TABLE t;"]);
        assert_eq!(spec.sessions[0].setup.as_deref(), Some("BEGIN;"));
        assert_eq!(spec.sessions[0].teardown.as_deref(), Some("COMMIT;"));
    }

    #[test]
    fn comments_are_ignored() {
        let spec = r#"
            # this is a comment
            session "s1" # trailing comment
            step "a" { SELECT 1; } # another
        "#;
        let spec = parse(spec).unwrap();
        assert_eq!(spec.sessions[0].steps[0].name, "a");
    }
}
