//! PTY 経由の REPL 統合テスト。
//!
//! 実バイナリを擬似端末にぶら下げ、ジョブコントロールの観測可能な
//! 振る舞い（報告行、サスペンド/再開、シャットダウン時の後始末）を
//! 端から端まで確認する。
//!
//! 注意: 端末へのエコーにはユーザが打った文字列そのものも含まれるため、
//! コマンド出力を待つときは打鍵エコーに含まれない文字列を使うか、
//! 同じ文字列を 2 回 expect する。

use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use rexpect::error::Error;
use rexpect::session::{spawn_command, PtySession};

const TIMEOUT_MS: u64 = 10_000;

/// 一時ディレクトリを HOME にしてシェルを起動する
/// （履歴ファイルを散らかさないため）。
fn spawn_shell(home: &Path) -> Result<PtySession, Error> {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_jsh"));
    cmd.env("HOME", home).env("RUST_LOG", "error");
    let mut session = spawn_command(cmd, Some(TIMEOUT_MS))?;
    session.exp_string("# ")?;
    Ok(session)
}

#[test]
fn background_job_is_announced_and_reported() -> Result<(), Error> {
    let home = tempfile::tempdir().unwrap();
    let mut p = spawn_shell(home.path())?;

    p.send_line("sleep 1 &")?;
    p.exp_string("[1] running 'sleep 1'")?;

    // 完了後、次のプロンプトの前に報告が出る
    thread::sleep(Duration::from_millis(1500));
    p.send_line("")?;
    p.exp_string("[1] exited 'sleep 1', status=0")?;

    p.send_line("exit")?;
    p.exp_eof()?;
    Ok(())
}

#[test]
fn ctrl_z_suspends_and_fg_resumes() -> Result<(), Error> {
    let home = tempfile::tempdir().unwrap();
    let mut p = spawn_shell(home.path())?;

    p.send_line("sleep 2")?;
    thread::sleep(Duration::from_millis(300));
    p.send_control('z')?;
    p.exp_string("[1] suspended 'sleep 2'")?;

    p.send_line("fg")?;
    p.exp_string("[1] continue 'sleep 2'")?;

    // ジョブ完了後にプロンプトへ戻っていること
    p.exp_string("# ")?;
    p.send_line("echo back-at-prompt")?;
    p.exp_string("back-at-prompt")?; // 打鍵エコー
    p.exp_string("back-at-prompt")?; // コマンド出力
    p.send_line("exit")?;
    p.exp_eof()?;
    Ok(())
}

#[test]
fn suspended_job_can_be_killed() -> Result<(), Error> {
    let home = tempfile::tempdir().unwrap();
    let mut p = spawn_shell(home.path())?;

    p.send_line("sleep 30")?;
    thread::sleep(Duration::from_millis(300));
    p.send_control('z')?;
    p.exp_string("[1] suspended 'sleep 30'")?;

    // 停止中のジョブには SIGCONT も送られ、SIGTERM が配送される
    p.send_line("kill 1")?;
    thread::sleep(Duration::from_millis(300));
    p.send_line("")?;
    p.exp_string("[1] killed 'sleep 30' by signal 15")?;

    p.send_line("exit")?;
    p.exp_eof()?;
    Ok(())
}

#[test]
fn pipeline_runs_as_one_job() -> Result<(), Error> {
    let home = tempfile::tempdir().unwrap();
    let mut p = spawn_shell(home.path())?;

    // `echo` はビルトインだがパイプライン内では子プロセスとして動く
    p.send_line("echo hello | wc -c")?;
    p.exp_string("6")?;

    p.send_line("exit")?;
    p.exp_eof()?;
    Ok(())
}

#[test]
fn redirections_round_trip_through_files() -> Result<(), Error> {
    let home = tempfile::tempdir().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.txt");
    let dst = dir.path().join("dst.txt");
    std::fs::write(&src, "abc").unwrap();

    let mut p = spawn_shell(home.path())?;
    p.send_line(&format!("cat < {} > {}", src.display(), dst.display()))?;

    // 完了同期: 次のコマンドの出力が見えた時点でリダイレクトは終わっている
    p.send_line("echo sync-point")?;
    p.exp_string("sync-point")?;
    p.exp_string("sync-point")?;
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "abc");

    p.send_line("exit")?;
    p.exp_eof()?;
    Ok(())
}

#[test]
fn sigint_at_prompt_does_not_kill_the_shell() -> Result<(), Error> {
    let home = tempfile::tempdir().unwrap();
    let mut p = spawn_shell(home.path())?;

    p.send_control('c')?;
    p.exp_string("^C")?;

    p.send_line("echo still-alive")?;
    p.exp_string("still-alive")?; // 打鍵エコー
    p.exp_string("still-alive")?; // コマンド出力

    p.send_line("exit")?;
    p.exp_eof()?;
    Ok(())
}

#[test]
fn foreground_failure_is_not_a_job_report() -> Result<(), Error> {
    let home = tempfile::tempdir().unwrap();
    let mut p = spawn_shell(home.path())?;

    p.send_line("false")?;
    p.send_line("echo quiet")?;
    p.exp_string("quiet")?;
    p.exp_string("quiet")?;

    p.send_line("exit")?;
    p.exp_eof()?;
    Ok(())
}

#[test]
fn unknown_command_reports_127() -> Result<(), Error> {
    let home = tempfile::tempdir().unwrap();
    let mut p = spawn_shell(home.path())?;

    p.send_line("no-such-command-jsh")?;
    p.exp_string("command not found")?;

    p.send_line("exit")?;
    p.exp_eof()?;
    Ok(())
}

#[test]
fn jobs_builtin_lists_running_jobs() -> Result<(), Error> {
    let home = tempfile::tempdir().unwrap();
    let mut p = spawn_shell(home.path())?;

    p.send_line("sleep 30 &")?;
    p.exp_string("[1] running 'sleep 30'")?;

    p.send_line("jobs")?;
    p.exp_string("[1] running 'sleep 30'")?;

    p.send_line("exit")?;
    p.exp_string("[1] killed 'sleep 30' by signal 15")?;
    p.exp_eof()?;
    Ok(())
}

#[test]
fn shutdown_terminates_remaining_jobs() -> Result<(), Error> {
    let home = tempfile::tempdir().unwrap();
    let mut p = spawn_shell(home.path())?;

    p.send_line("sleep 30 &")?;
    p.exp_string("[1] running 'sleep 30'")?;

    p.send_line("exit")?;
    p.exp_string("[1] killed 'sleep 30' by signal 15")?;
    p.exp_eof()?;
    Ok(())
}

#[test]
fn bg_continues_a_stopped_job() -> Result<(), Error> {
    let home = tempfile::tempdir().unwrap();
    let mut p = spawn_shell(home.path())?;

    p.send_line("sleep 1")?;
    thread::sleep(Duration::from_millis(200));
    p.send_control('z')?;
    p.exp_string("[1] suspended 'sleep 1'")?;

    p.send_line("bg")?;
    p.exp_string("[1] continue 'sleep 1'")?;

    // 再開されたジョブはバックグラウンドで完走する
    thread::sleep(Duration::from_millis(1200));
    p.send_line("")?;
    p.exp_string("[1] exited 'sleep 1', status=0")?;

    p.send_line("exit")?;
    p.exp_eof()?;
    Ok(())
}
