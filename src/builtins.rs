//! ビルトインコマンドの実装。
//!
//! ディスパッチは [`try_exec`]: `Some(status)` ならビルトインとして処理
//! 済み、`None` なら外部コマンドとして executor に委ねる。
//!
//! `pwd` / `echo` / `jobs` は書き込み先を引数で受け取る。出力リダイレクト
//! 付きで呼ばれたときは executor がリダイレクト先の fd を渡してくる。
//!
//! ジョブ制御系（`jobs` / `fg` / `bg` / `kill`）はシェル本体の
//! ジョブテーブルとターミナルを操作するため、フォアグラウンドの
//! 単一コマンドとして実行されたときにだけ意味を持つ。

use std::env;
use std::io::Write;
use std::path::Path;

use crate::job;
use crate::shell::Shell;

/// コマンド名がビルトインかどうかを判定する。
pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "exit" | "cd" | "pwd" | "echo" | "jobs" | "fg" | "bg" | "kill"
    )
}

/// ビルトインコマンドの実行を試みる。
///
/// 戻り値:
/// - `Some(status)` — ビルトインとして実行済み
/// - `None` — 該当なし（外部コマンドとして実行すべき）
pub fn try_exec(shell: &mut Shell, args: &[String], out: &mut dyn Write) -> Option<i32> {
    match args[0].as_str() {
        "exit" => Some(builtin_exit(shell, args)),
        "cd" => Some(builtin_cd(args)),
        "pwd" => Some(builtin_pwd(out)),
        "echo" => Some(builtin_echo(args, out)),
        "jobs" => Some(builtin_jobs(shell, out)),
        "fg" => Some(builtin_resume(shell, args, false)),
        "bg" => Some(builtin_resume(shell, args, true)),
        "kill" => Some(builtin_kill(shell, args)),
        _ => None,
    }
}

/// `exit [N]` — シェルを終了する。N 省略時は直前のステータスで終了。
fn builtin_exit(shell: &mut Shell, args: &[String]) -> i32 {
    shell.should_exit = true;
    match args.get(1) {
        Some(arg) => arg.parse().unwrap_or_else(|_| {
            eprintln!("jsh: exit: {arg}: numeric argument required");
            2
        }),
        None => shell.last_status,
    }
}

/// `cd [dir]` — カレントディレクトリを変更する。引数省略時は `$HOME`。
fn builtin_cd(args: &[String]) -> i32 {
    let target = match args.get(1) {
        Some(dir) => dir.clone(),
        None => match env::var("HOME") {
            Ok(home) => home,
            Err(_) => {
                eprintln!("jsh: cd: HOME not set");
                return 1;
            }
        },
    };
    match env::set_current_dir(Path::new(&target)) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("jsh: cd: {target}: {e}");
            1
        }
    }
}

/// `pwd` — カレントディレクトリを出力する。
fn builtin_pwd(out: &mut dyn Write) -> i32 {
    match env::current_dir() {
        Ok(path) => {
            let _ = writeln!(out, "{}", path.display());
            0
        }
        Err(e) => {
            eprintln!("jsh: pwd: {e}");
            1
        }
    }
}

/// `echo [-n] args...` — 引数をスペース区切りで出力する。`-n` で改行抑制。
fn builtin_echo(args: &[String], out: &mut dyn Write) -> i32 {
    let (newline, words) = match args.get(1).map(String::as_str) {
        Some("-n") => (false, &args[2..]),
        _ => (true, &args[1..]),
    };
    let _ = write!(out, "{}", words.join(" "));
    if newline {
        let _ = writeln!(out);
    }
    0
}

/// `jobs` — 全バックグラウンドジョブを状態つきで一覧する。
/// 完了済みジョブはこの一覧と同時にテーブルから解放される。
fn builtin_jobs(shell: &mut Shell, out: &mut dyn Write) -> i32 {
    job::reap(&mut shell.jobs);
    job::watch_jobs(&mut shell.jobs, None, out);
    0
}

/// `fg [job]` / `bg [job]` — 停止中のジョブを再開する。
/// ジョブ番号省略時は最も新しい未完了ジョブ。
fn builtin_resume(shell: &mut Shell, args: &[String], bg: bool) -> i32 {
    let name = if bg { "bg" } else { "fg" };
    let j = match job_number(args) {
        Ok(j) => j,
        Err(arg) => {
            eprintln!("jsh: {name}: {arg}: invalid job number");
            return 2;
        }
    };
    if job::resume_job(&mut shell.jobs, &shell.terminal, j, bg) {
        0
    } else {
        eprintln!("jsh: {name}: no such job");
        1
    }
}

/// `kill job` — ジョブに SIGTERM を送る（停止中なら SIGCONT も）。
fn builtin_kill(shell: &mut Shell, args: &[String]) -> i32 {
    let j = match job_number(args) {
        Ok(Some(j)) => j,
        Ok(None) => {
            eprintln!("jsh: kill: usage: kill job");
            return 2;
        }
        Err(arg) => {
            eprintln!("jsh: kill: {arg}: invalid job number");
            return 2;
        }
    };
    job::reap(&mut shell.jobs);
    if job::kill_job(&shell.jobs, j) {
        0
    } else {
        eprintln!("jsh: kill: no such job");
        1
    }
}

/// ジョブ番号引数を解釈する。`%1` 形式と裸の数字の両方を受け付ける。
fn job_number(args: &[String]) -> Result<Option<usize>, &str> {
    match args.get(1) {
        None => Ok(None),
        Some(arg) => {
            let digits = arg.strip_prefix('%').unwrap_or(arg);
            digits.parse().map(Some).map_err(|_| arg.as_str())
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Vec<String> {
        argv.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builtin_table() {
        for name in ["exit", "cd", "pwd", "echo", "jobs", "fg", "bg", "kill"] {
            assert!(is_builtin(name), "{name} should be a builtin");
        }
        assert!(!is_builtin("ls"));
        assert!(!is_builtin("sleep"));
    }

    #[test]
    fn echo_joins_words() {
        let mut out = Vec::new();
        assert_eq!(builtin_echo(&args(&["echo", "hello", "world"]), &mut out), 0);
        assert_eq!(String::from_utf8(out).unwrap(), "hello world\n");
    }

    #[test]
    fn echo_n_suppresses_newline() {
        let mut out = Vec::new();
        builtin_echo(&args(&["echo", "-n", "hi"]), &mut out);
        assert_eq!(String::from_utf8(out).unwrap(), "hi");
    }

    #[test]
    fn echo_without_args_prints_newline() {
        let mut out = Vec::new();
        builtin_echo(&args(&["echo"]), &mut out);
        assert_eq!(String::from_utf8(out).unwrap(), "\n");
    }

    #[test]
    fn pwd_prints_a_directory() {
        let mut out = Vec::new();
        assert_eq!(builtin_pwd(&mut out), 0);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with('/'));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn cd_rejects_missing_directory() {
        assert_eq!(builtin_cd(&args(&["cd", "/no/such/dir/jsh-test"])), 1);
    }

    #[test]
    fn job_number_accepts_percent_prefix() {
        assert_eq!(job_number(&args(&["fg", "%2"])), Ok(Some(2)));
        assert_eq!(job_number(&args(&["fg", "3"])), Ok(Some(3)));
        assert_eq!(job_number(&args(&["fg"])), Ok(None));
        assert!(job_number(&args(&["fg", "abc"])).is_err());
    }
}
