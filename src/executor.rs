//! パイプライン構築: トークン列からジョブを組み立てて実行する。
//!
//! 実行の流れ:
//!
//! 1. 末尾の `&` を外してバックグラウンド実行かを決める
//! 2. `|` でステージに分割し、各ステージの argv とリダイレクトを先に
//!    検証する（fd を開く前に構文エラーを返すため）
//! 3. SIGCHLD をブロックし、ステージを順に起動してジョブに登録する。
//!    外部コマンドは [`spawn`](crate::spawn::spawn)、ビルトインは fork した
//!    子プロセス内で実行する
//! 4. フォアグラウンドなら [`monitor_job`](crate::job::monitor_job) で
//!    待機、バックグラウンドなら `[n] running` を報告して戻る
//!
//! プロセスグループは最初のステージの PID で作る。グループへの参加は
//! spawn 属性（または fork した子自身）と親の `setpgid` の両方で行い、
//! どちらが先に走ってもグループが存在する状態を保つ。

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::FromRawFd;

use libc::pid_t;
use thiserror::Error;
use tracing::debug;

use crate::builtins;
use crate::fatal;
use crate::job;
use crate::parser::{self, Token};
use crate::shell::Shell;
use crate::signal::{self, SigchldBlocked};
use crate::spawn;

// ── エラー型 ────────────────────────────────────────────────────────

/// コマンドの組み立てに失敗した。現在のコマンドだけを中断して
/// プロンプトに戻る。
#[derive(Debug, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("missing file name after redirection")]
    MissingRedirectTarget,
    #[error("empty pipeline stage")]
    EmptyStage,
    #[error("`&` must be the last token")]
    StrayBackground,
}

// ── 行の評価 ────────────────────────────────────────────────────────

/// 1 行を評価し、終了ステータスを返す。
/// 字句・構文エラーは診断を出してステータス 2 を返す。
pub fn eval(shell: &mut Shell, line: &str) -> i32 {
    let tokens = match parser::tokenize(line) {
        Ok(tokens) => tokens,
        Err(e) => {
            eprintln!("jsh: {e}");
            return 2;
        }
    };
    if tokens.is_empty() {
        return shell.last_status;
    }

    match run(shell, tokens) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("jsh: {e}");
            2
        }
    }
}

fn run(shell: &mut Shell, mut tokens: Vec<Token>) -> Result<i32, CommandError> {
    let bg = tokens.last() == Some(&Token::Background);
    if bg {
        tokens.pop();
    }
    if tokens.contains(&Token::Background) {
        return Err(CommandError::StrayBackground);
    }
    if tokens.is_empty() {
        return Err(CommandError::EmptyStage);
    }

    if tokens.contains(&Token::Pipe) {
        run_pipeline(shell, tokens, bg)
    } else {
        run_single(shell, tokens, bg)
    }
}

// ── ステージ計画 ────────────────────────────────────────────────────

#[derive(Debug)]
enum RedirKind {
    In,
    Out,
}

/// 検証済みの 1 ステージ。argv とリダイレクト指定（出現順）を持つ。
#[derive(Debug)]
struct StagePlan {
    argv: Vec<String>,
    redirs: Vec<(RedirKind, String)>,
}

/// ステージのトークン列を argv とリダイレクトに分解する。
/// リダイレクト対象が欠けている、または argv が空なら構文エラー。
fn plan_stage(tokens: Vec<Token>) -> Result<StagePlan, CommandError> {
    let mut argv = Vec::new();
    let mut redirs = Vec::new();
    let mut it = tokens.into_iter();

    while let Some(tok) = it.next() {
        let kind = match tok {
            Token::Word(w) => {
                argv.push(w);
                continue;
            }
            Token::Input => RedirKind::In,
            Token::Output => RedirKind::Out,
            // `&` は run() で除去済み、`|` は分割済み
            Token::Pipe | Token::Background => return Err(CommandError::EmptyStage),
        };
        match it.next() {
            Some(Token::Word(path)) => redirs.push((kind, path)),
            _ => return Err(CommandError::MissingRedirectTarget),
        }
    }

    if argv.is_empty() {
        return Err(CommandError::EmptyStage);
    }
    Ok(StagePlan { argv, redirs })
}

/// リダイレクトを出現順に開く。同方向が複数あれば後のものが勝ち、
/// 先に開いた fd はその場で閉じる。初期値にはパイプ端（または -1）を渡す。
fn apply_redirs(redirs: &[(RedirKind, String)], input: i32, output: i32) -> (i32, i32) {
    let mut input = input;
    let mut output = output;
    for (kind, path) in redirs {
        match kind {
            RedirKind::In => {
                maybe_close(&mut input);
                input = open_read(path);
            }
            RedirKind::Out => {
                maybe_close(&mut output);
                output = open_write(path);
            }
        }
    }
    (input, output)
}

// ── 単一コマンド ────────────────────────────────────────────────────

fn run_single(shell: &mut Shell, tokens: Vec<Token>, bg: bool) -> Result<i32, CommandError> {
    let plan = plan_stage(tokens)?;

    // フォアグラウンドのビルトインは fork せずシェル内で実行する。
    // 出力リダイレクトがあればその fd をビルトインの書き込み先にする。
    if !bg && builtins::is_builtin(&plan.argv[0]) {
        let (mut input, output) = apply_redirs(&plan.redirs, -1, -1);
        let code = if output != -1 {
            let mut file = unsafe { File::from_raw_fd(output) };
            builtins::try_exec(shell, &plan.argv, &mut file).unwrap_or(1)
        } else {
            builtins::try_exec(shell, &plan.argv, &mut io::stdout()).unwrap_or(1)
        };
        maybe_close(&mut input);
        return Ok(code);
    }

    let (mut input, mut output) = apply_redirs(&plan.redirs, -1, -1);
    let guard = signal::block_sigchld();

    let pid = if builtins::is_builtin(&plan.argv[0]) {
        fork_builtin(shell, &plan.argv, 0, input, output, &[], &guard)
    } else {
        match spawn::spawn(
            &plan.argv,
            0,
            fd_opt(input),
            fd_opt(output),
            &[],
            guard.prev_mask(),
        ) {
            Ok(pid) => pid,
            Err(e) => {
                eprintln!("jsh: {e}");
                maybe_close(&mut input);
                maybe_close(&mut output);
                return Ok(e.exit_status());
            }
        }
    };
    unsafe {
        libc::setpgid(pid, pid);
    }
    maybe_close(&mut input);
    maybe_close(&mut output);

    let j = shell.jobs.add_job(pid, bg, shell.terminal.shell_modes());
    shell.jobs.add_proc(j, pid, &plan.argv);

    let code = if bg {
        println!("[{j}] running '{}'", shell.jobs.command(j).unwrap_or(""));
        0
    } else {
        job::monitor_job(&mut shell.jobs, &shell.terminal, &guard)
    };
    Ok(code)
}

// ── パイプライン ────────────────────────────────────────────────────

fn run_pipeline(shell: &mut Shell, tokens: Vec<Token>, bg: bool) -> Result<i32, CommandError> {
    // fd を開く前に全ステージを検証する
    let mut stages: Vec<Vec<Token>> = vec![Vec::new()];
    for tok in tokens {
        if tok == Token::Pipe {
            stages.push(Vec::new());
        } else {
            stages.last_mut().expect("stages never empty").push(tok);
        }
    }
    let plans: Vec<StagePlan> = stages
        .into_iter()
        .map(plan_stage)
        .collect::<Result<_, _>>()?;

    let guard = signal::block_sigchld();
    let mut pgid: pid_t = 0;
    let mut job_slot: Option<usize> = None;
    let mut carried: i32 = -1; // 前段パイプの読み端
    let count = plans.len();

    for (i, plan) in plans.into_iter().enumerate() {
        let (next_read, pipe_write) = if i + 1 < count { mkpipe() } else { (-1, -1) };
        // 明示的なリダイレクトはパイプ端より優先し、置き換えた端は閉じる
        let (mut input, mut output) = apply_redirs(&plan.redirs, carried, pipe_write);

        let pid = launch_stage(shell, &plan, pgid, input, output, &[next_read], &guard);
        if pgid == 0 {
            // 最初のステージの PID がプロセスグループになる
            pgid = pid;
            job_slot = Some(shell.jobs.add_job(pgid, bg, shell.terminal.shell_modes()));
        }
        unsafe {
            libc::setpgid(pid, pgid);
        }
        let j = job_slot.expect("job created with first stage");
        shell.jobs.add_proc(j, pid, &plan.argv);

        maybe_close(&mut input);
        maybe_close(&mut output);
        carried = next_read;
    }

    let j = job_slot.expect("pipeline has at least two stages");
    debug!(slot = j, pgid, stages = count, "pipeline started");
    let code = if bg {
        println!("[{j}] running '{}'", shell.jobs.command(j).unwrap_or(""));
        0
    } else {
        job::monitor_job(&mut shell.jobs, &shell.terminal, &guard)
    };
    Ok(code)
}

/// ステージを 1 つ起動する。ビルトインは fork、外部コマンドは spawn。
/// spawn に失敗したときは、その終了ステータスで即終了する子を代わりに
/// 立ててパイプラインの形を保つ。
fn launch_stage(
    shell: &mut Shell,
    plan: &StagePlan,
    pgid: pid_t,
    input: i32,
    output: i32,
    fds_to_close: &[i32],
    guard: &SigchldBlocked,
) -> pid_t {
    if builtins::is_builtin(&plan.argv[0]) {
        return fork_builtin(shell, &plan.argv, pgid, input, output, fds_to_close, guard);
    }
    match spawn::spawn(
        &plan.argv,
        pgid,
        fd_opt(input),
        fd_opt(output),
        fds_to_close,
        guard.prev_mask(),
    ) {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!("jsh: {e}");
            fork_exit(e.exit_status(), pgid, guard)
        }
    }
}

/// ビルトインをパイプラインステージ（またはバックグラウンドジョブ）として
/// fork した子プロセス内で実行する。
///
/// 子側はシグナルマスクの復元 → 配送設定のリセット → プロセスグループ
/// 参加 → fd の付け替え、の順で外部コマンドと同じ初期状態を作ってから
/// ビルトインを実行し、その終了コードで exit する。
fn fork_builtin(
    shell: &mut Shell,
    argv: &[String],
    pgid: pid_t,
    input: i32,
    output: i32,
    fds_to_close: &[i32],
    guard: &SigchldBlocked,
) -> pid_t {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        fatal("fork");
    }
    if pid != 0 {
        return pid;
    }

    // ── ここから子プロセス ──
    guard.restore_in_child();
    signal::reset_child_dispositions();
    unsafe {
        libc::setpgid(0, pgid);
        if input != -1 {
            if libc::dup2(input, libc::STDIN_FILENO) < 0 {
                libc::_exit(126);
            }
            libc::close(input);
        }
        if output != -1 {
            if libc::dup2(output, libc::STDOUT_FILENO) < 0 {
                libc::_exit(126);
            }
            libc::close(output);
        }
        for &fd in fds_to_close {
            if fd != -1 {
                libc::close(fd);
            }
        }
    }
    let code = builtins::try_exec(shell, argv, &mut io::stdout()).unwrap_or(127);
    let _ = io::stdout().flush();
    unsafe { libc::_exit(code) }
}

/// 指定の終了コードで即終了する子を立てる。spawn 失敗時の穴埋め用。
fn fork_exit(code: i32, pgid: pid_t, guard: &SigchldBlocked) -> pid_t {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        fatal("fork");
    }
    if pid == 0 {
        guard.restore_in_child();
        unsafe {
            libc::setpgid(0, pgid);
            libc::_exit(code);
        }
    }
    pid
}

// ── fd ヘルパー ─────────────────────────────────────────────────────

fn fd_opt(fd: i32) -> Option<i32> {
    (fd >= 0).then_some(fd)
}

/// 両端に FD_CLOEXEC を立てたパイプを作る。戻り値は (読み端, 書き端)。
/// exec したステージに未使用の端が漏れないようにする。
fn mkpipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        fatal("pipe");
    }
    unsafe {
        libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
        libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
    }
    (fds[0], fds[1])
}

/// fd が開いていれば閉じ、-1 に書き換えて二重クローズを防ぐ。
fn maybe_close(fd: &mut i32) {
    if *fd >= 0 {
        unsafe {
            libc::close(*fd);
        }
        *fd = -1;
    }
}

fn open_read(path: &str) -> i32 {
    let cpath = CString::new(path).unwrap_or_default();
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        fatal("open");
    }
    fd
}

fn open_write(path: &str) -> i32 {
    let cpath = CString::new(path).unwrap_or_default();
    let mode = (libc::S_IRWXU | libc::S_IRWXG | libc::S_IRWXO) as libc::c_uint;
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_WRONLY | libc::O_CREAT, mode) };
    if fd < 0 {
        fatal("open");
    }
    fd
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn tokens(line: &str) -> Vec<Token> {
        parser::tokenize(line).unwrap()
    }

    #[test]
    fn plan_splits_words_and_redirs() {
        let plan = plan_stage(tokens("cat < in.txt > out.txt -n")).unwrap();
        assert_eq!(plan.argv, vec!["cat", "-n"]);
        assert_eq!(plan.redirs.len(), 2);
    }

    #[test]
    fn plan_rejects_missing_redirect_target() {
        assert_eq!(
            plan_stage(tokens("cat <")).unwrap_err(),
            CommandError::MissingRedirectTarget
        );
        assert_eq!(
            plan_stage(tokens("cat > < in")).unwrap_err(),
            CommandError::MissingRedirectTarget
        );
    }

    #[test]
    fn plan_rejects_redirect_only_stage() {
        assert_eq!(
            plan_stage(tokens("> out.txt")).unwrap_err(),
            CommandError::EmptyStage
        );
    }

    #[test]
    fn last_output_redirection_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        let redirs = vec![
            (RedirKind::Out, first.display().to_string()),
            (RedirKind::Out, second.display().to_string()),
        ];

        let (input, mut output) = apply_redirs(&redirs, -1, -1);
        assert_eq!(input, -1);
        assert!(output >= 0);
        let n = unsafe { libc::write(output, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
        maybe_close(&mut output);

        // 先に開いた方はファイルだけ作られて空のまま
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "x");
    }

    #[test]
    fn last_input_redirection_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.txt");
        let second = dir.path().join("b.txt");
        std::fs::write(&first, "AAA").unwrap();
        std::fs::write(&second, "BBB").unwrap();
        let redirs = vec![
            (RedirKind::In, first.display().to_string()),
            (RedirKind::In, second.display().to_string()),
        ];

        let (input, output) = apply_redirs(&redirs, -1, -1);
        assert_eq!(output, -1);
        let mut file = unsafe { File::from_raw_fd(input) };
        let mut buf = String::new();
        file.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "BBB");
    }

    #[test]
    fn maybe_close_is_idempotent() {
        let mut fd = -1;
        maybe_close(&mut fd);
        assert_eq!(fd, -1);
    }

    #[test]
    fn background_must_be_last() {
        // run() まで通すにはシェルが必要なので、判定材料だけ確認する
        let toks = tokens("sleep 1 & echo x");
        assert_ne!(toks.last(), Some(&Token::Background));
        assert!(toks.contains(&Token::Background));
    }
}
