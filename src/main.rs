//! jsh — ジョブコントロール付きの対話シェル。
//!
//! REPL ループ: 完了ジョブの報告 → プロンプト表示と行読み取り → 評価。
//! EOF または `exit` でループを抜け、残ったジョブをすべて終了させてから
//! シェル自身が終了する。

use std::io;

use tracing_subscriber::EnvFilter;

use jsh::editor::{LineEditor, ReadOutcome};
use jsh::job::{self, JobState};
use jsh::shell::Shell;
use jsh::tty::Terminal;
use jsh::{executor, signal};

fn main() {
    // ログは stderr へ。既定は warn、RUST_LOG で上書きできる。
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .init();

    // セッションリーダーでなければ自分のプロセスグループを作る
    unsafe {
        if libc::getsid(0) != libc::getpgid(0) {
            libc::setpgid(0, 0);
        }
    }

    signal::install();
    let mut shell = Shell::new(Terminal::new());
    let mut editor = LineEditor::new();

    loop {
        // プロンプトの前に完了したバックグラウンドジョブを報告する
        if signal::take_sigchld() {
            job::reap(&mut shell.jobs);
        }
        job::watch_jobs(
            &mut shell.jobs,
            Some(JobState::Finished),
            &mut io::stdout(),
        );

        match editor.read_line("# ") {
            ReadOutcome::Line(line) => {
                let line = line.trim();
                if !line.is_empty() {
                    editor.add_history(line);
                    shell.last_status = executor::eval(&mut shell, line);
                }
            }
            ReadOutcome::Interrupted => continue,
            ReadOutcome::Eof => break,
        }

        if shell.should_exit {
            break;
        }
    }

    job::shutdown_jobs(&mut shell.jobs, &mut io::stdout());
    let status = shell.last_status;
    // process::exit はデストラクタを走らせないため、端末 fd を先に閉じる
    drop(shell);
    std::process::exit(status);
}
