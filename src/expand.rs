//! Word expansion: parameters, `$?` and command substitution.

use crate::engine::Engine;
use crate::env::EnvStack;
use crate::error::ExecResult;
use crate::lexer::WordPart;
use crate::parser::{Assignment, RedirWord, Word};
use crate::redirect::RedirToken;

/// Whether `s` is a valid variable name: a letter or `_`, then letters, digits or `_`.
pub fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Expand one word against the current frame.
///
/// `$(...)` bodies run in capture mode in a nested frame; their trailing
/// newlines are dropped.
pub async fn word(word: &Word, env: &mut EnvStack, engine: &Engine) -> ExecResult<String> {
    let parts = match word {
        Word::Literal(s) => return Ok(s.clone()),
        Word::Compound(parts) => parts,
    };
    let mut out = String::new();
    for part in parts {
        match part {
            WordPart::Literal(s) => out.push_str(s),
            WordPart::ParamSubst(name) => out.push_str(env.get_var(name).unwrap_or_default()),
            WordPart::LastStatus => out.push_str(&engine.last_status().to_string()),
            WordPart::CmdSubst(body) => {
                let captured = engine.substitute(body, env).await?;
                out.push_str(captured.trim_end_matches('\n'));
            }
        }
    }
    Ok(out)
}

pub async fn words(items: &[Word], env: &mut EnvStack, engine: &Engine) -> ExecResult<Vec<String>> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(word(item, env, engine).await?);
    }
    Ok(out)
}

pub async fn assignments(
    items: &[Assignment],
    env: &mut EnvStack,
    engine: &Engine,
) -> ExecResult<Vec<(String, String)>> {
    let mut out = Vec::with_capacity(items.len());
    for Assignment { name, value } in items {
        out.push((name.clone(), word(value, env, engine).await?));
    }
    Ok(out)
}

/// Expand redirection targets into the flat token array the resolver takes.
pub async fn redirections(
    items: &[RedirWord],
    env: &mut EnvStack,
    engine: &Engine,
) -> ExecResult<Vec<RedirToken>> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(match item {
            RedirWord::Operator(op) => RedirToken::Operator(op.clone()),
            RedirWord::Descriptor(fd) => RedirToken::Descriptor(*fd),
            RedirWord::Target(target) => RedirToken::Path(word(target, env, engine).await?),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;
    use crate::error::ExecError;

    fn compound(parts: Vec<WordPart>) -> Word {
        Word::Compound(parts)
    }

    #[test]
    fn names() {
        assert!(is_name("PATH"));
        assert!(is_name("_x1"));
        assert!(!is_name("1x"));
        assert!(!is_name(""));
        assert!(!is_name("a-b"));
    }

    #[tokio::test]
    async fn parameters_and_status() {
        let engine = Engine::detached(ShellConfig::default());
        let mut env = EnvStack::new([("USER", "ann")].into_iter().collect());
        let w = compound(vec![
            WordPart::Literal("hi ".into()),
            WordPart::ParamSubst("USER".into()),
            WordPart::Literal(" ".into()),
            WordPart::ParamSubst("MISSING".into()),
            WordPart::LastStatus,
        ]);
        assert_eq!(word(&w, &mut env, &engine).await.unwrap(), "hi ann 0");
    }

    #[tokio::test]
    async fn command_substitution_trims_trailing_newlines() {
        let engine = Engine::detached(ShellConfig::default());
        let mut env = EnvStack::default();
        let w = compound(vec![
            WordPart::Literal("<".into()),
            WordPart::CmdSubst("echo a; echo b".into()),
            WordPart::Literal(">".into()),
        ]);
        assert_eq!(word(&w, &mut env, &engine).await.unwrap(), "<a\nb>");
        assert_eq!(env.depth(), 1);
    }

    #[tokio::test]
    async fn substitution_parse_errors_surface() {
        let engine = Engine::detached(ShellConfig::default());
        let mut env = EnvStack::default();
        let w = compound(vec![WordPart::CmdSubst("echo |".into())]);
        let err = word(&w, &mut env, &engine).await.unwrap_err();
        assert!(matches!(err, ExecError::Parse(_)));
    }

    #[tokio::test]
    async fn redirection_targets_are_expanded() {
        let engine = Engine::detached(ShellConfig::default());
        let mut env = EnvStack::new([("DIR", "/tmp")].into_iter().collect());
        let items = vec![
            RedirWord::Operator(">".into()),
            RedirWord::Target(compound(vec![
                WordPart::ParamSubst("DIR".into()),
                WordPart::Literal("/out".into()),
            ])),
            RedirWord::Operator("2>".into()),
            RedirWord::Descriptor(1),
        ];
        let tokens = redirections(&items, &mut env, &engine).await.unwrap();
        assert_eq!(
            tokens,
            vec![
                RedirToken::Operator(">".into()),
                RedirToken::Path("/tmp/out".into()),
                RedirToken::Operator("2>".into()),
                RedirToken::Descriptor(1),
            ]
        );
    }
}
