//! シェルの実行状態。
//!
//! ジョブテーブル・制御端末・直前の終了ステータスを 1 つの所有値に
//! まとめ、REPL ループから各所に渡す。グローバル変数は持たない
//! （テストが独立したインスタンスを作れるようにするため）。

use crate::job::JobTable;
use crate::tty::Terminal;

/// シェルの実行状態。REPL ループ全体で共有される。
pub struct Shell {
    /// 直前のコマンドの終了ステータス。`exit` のデフォルト値に使う。
    pub last_status: i32,
    /// `exit` ビルトインで true になり、REPL ループを終了させる。
    pub should_exit: bool,
    /// ジョブテーブル。
    pub jobs: JobTable,
    /// 制御端末。
    pub terminal: Terminal,
}

impl Shell {
    pub fn new(terminal: Terminal) -> Self {
        Self {
            last_status: 0,
            should_exit: false,
            jobs: JobTable::new(),
            terminal,
        }
    }
}
