//! jsh ライブラリ — テスト・外部クレートからモジュールを利用できるように公開する。
//!
//! バイナリ本体は `main.rs` の REPL ループ。
//! この `lib.rs` はユニットテストおよび `tests/repl.rs` 等の
//! 統合テストから各モジュールに直接アクセスするために存在する。
//!
//! ## モジュール構成
//!
//! | モジュール | 役割 |
//! |-----------|------|
//! | [`tty`] | ターミナル制御（制御端末 fd の複製、termios 保存/復元、フォアグラウンド委譲） |
//! | [`signal`] | シグナル設定（SIGCHLD/SIGINT ハンドラ、マスクガード、sigsuspend） |
//! | [`job`] | ジョブコントロールの中核（ジョブテーブル、reaper、フォアグラウンド監視、fg/bg/kill） |
//! | [`parser`] | トークナイザ（ワード、`\|`、`<`、`>`、末尾 `&`、クォート） |
//! | [`spawn`] | `posix_spawnp` ラッパー（プロセスグループ、シグナルリセット、fd アクション） |
//! | [`executor`] | パイプライン構築（リダイレクト解決、ステージ起動、監視/通知） |
//! | [`builtins`] | ビルトイン（`exit`, `cd`, `pwd`, `echo`, `jobs`, `fg`, `bg`, `kill`） |
//! | [`editor`] | 行エディタ（raw モード、キー入力、履歴ナビゲーション） |
//! | [`history`] | コマンド履歴（`~/.jsh_history` 永続化） |
//! | [`shell`] | シェルの実行状態（終了ステータス、ジョブテーブル、ターミナル） |

pub mod builtins;
pub mod editor;
pub mod executor;
pub mod history;
pub mod job;
pub mod parser;
pub mod shell;
pub mod signal;
pub mod spawn;
pub mod tty;

/// 回復不能な OS 呼び出し失敗。診断を stderr に出して即終了する。
///
/// fork / pipe / dup2 / tcsetpgrp / sigprocmask 等の失敗はカーネル資源の
/// 枯渇を意味し、対話シェルに継続手段はない。
pub fn fatal(call: &str) -> ! {
    let err = std::io::Error::last_os_error();
    eprintln!("jsh: {call}: {err}");
    std::process::exit(2);
}
