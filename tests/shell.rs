use futures::StreamExt;
use futures::stream;
use shell_engine::command::{DeclaredCommand, Yield};
use shell_engine::{ExecError, Shell};

#[tokio::test]
async fn pipeline_in_capture_mode() {
    let mut sh = Shell::new();
    let out = sh.run("echo hi | cat").await.unwrap();
    assert_eq!(out.status, 0);
    assert_eq!(out.stdout, b"hi\n");
}

#[tokio::test]
async fn and_or_chain() {
    let mut sh = Shell::new();
    let out = sh.run("false && echo no || echo yes").await.unwrap();
    assert_eq!(out.status, 0);
    assert_eq!(out.stdout_lossy(), "yes\n");

    let out = sh.run("true && echo a || echo b").await.unwrap();
    assert_eq!(out.stdout_lossy(), "a\n");
}

#[tokio::test]
async fn exported_variables_show_in_env() {
    let mut sh = Shell::new();
    let out = sh.run("export FOO bar; env").await.unwrap();
    assert!(out.stdout_lossy().lines().any(|line| line == "FOO=bar"));

    let out = sh.run("(export INNER x; env) | grep INNER; env | grep -w INNER").await.unwrap();
    assert_eq!(out.stdout_lossy(), "INNER=x\n");
    assert_eq!(out.status, 1);
}

#[tokio::test]
async fn missing_program_skips_the_rest_of_the_chain() {
    let mut sh = Shell::new();
    let out = sh.run("no-such-program-here && echo ran").await.unwrap();
    assert_eq!(out.status, 127);
    assert!(out.stdout.is_empty());
    assert_eq!(sh.run("echo $?").await.unwrap().stdout_lossy(), "127\n");
}

#[tokio::test]
async fn capture_is_repeatable() {
    let mut sh = Shell::new();
    let first = sh.run("/bin/sh -c 'printf \"a\\nb\"' | cat").await.unwrap();
    let second = sh.run("/bin/sh -c 'printf \"a\\nb\"' | cat").await.unwrap();
    assert_eq!(first.stdout, b"a\nb");
    assert_eq!(first, second);
}

#[tokio::test]
async fn command_substitution_feeds_arguments() {
    let mut sh = Shell::new();
    let out = sh.run("echo \"x=$(echo 1; echo 2)\"").await.unwrap();
    assert_eq!(out.stdout_lossy(), "x=1\n2\n");
    assert!(matches!(sh.run("echo $(echo |)").await.unwrap().status, 1));
}

#[tokio::test]
async fn programs_and_builtins_mix() {
    let mut sh = Shell::new();
    let out = sh
        .run("/bin/sh -c 'echo apple; echo banana; echo cherry' | grep an | wc")
        .await
        .unwrap();
    assert_eq!(out.status, 0);
    let counts: Vec<&str> = std::str::from_utf8(&out.stdout).unwrap().split_whitespace().collect();
    assert_eq!(&counts[..3], ["1", "1", "7"]);
}

#[tokio::test]
async fn declared_generator_command() {
    let mut sh = Shell::new();
    sh.declare(
        "count",
        Some(DeclaredCommand::new(|args, _env, _stdin| {
            let n: usize = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
            stream::iter((1..=n).map(|i| Yield::Line(i.to_string())).chain([Yield::Status(0)])).boxed()
        })),
    );
    let out = sh.run("count 3 | wc").await.unwrap();
    assert_eq!(out.stdout_lossy(), "3 3 6\n");
}

#[tokio::test]
async fn script_modes_in_pipelines() {
    let mut sh = Shell::new();
    let out = sh.run("{* for i in 1..=3 { emit(`line ${i}`) } } | cat").await.unwrap();
    assert_eq!(out.stdout_lossy(), "line 1\nline 2\nline 3\n");

    let out = sh
        .run(r#"echo one two | {& let l = read_line(); write(l.to_upper() + "\n"); resolve(0) }"#)
        .await
        .unwrap();
    assert_eq!(out.stdout_lossy(), "ONE TWO\n");

    let out = sh.run("{& write(\"x\") }").await.unwrap();
    assert_ne!(out.status, 0);
}

#[tokio::test]
async fn parse_errors_surface_from_run() {
    let mut sh = Shell::new();
    assert!(matches!(sh.run("echo 'open").await, Err(ExecError::Parse(_))));
}
