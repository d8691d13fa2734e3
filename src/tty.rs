//! 制御端末の管理。
//!
//! シェル起動時に stdin から制御端末の fd を複製して保持し、
//! フォアグラウンドジョブとの間でターミナルの所有権（フォアグラウンド
//! プロセスグループ）と termios 設定を受け渡しする。
//!
//! 所有権の受け渡しは常に対で行う:
//! ジョブ開始前に [`Terminal::give_to`] でジョブへ、
//! プロンプトに戻る前に [`Terminal::take_back`] でシェルへ。

use std::mem;

use libc::{pid_t, termios};

use crate::fatal;

/// 制御端末。fd と、シェル自身の termios スナップショットを保持する。
///
/// fd は stdin の複製で FD_CLOEXEC を立てる（exec する子に漏らさない）。
/// termios スナップショットは起動時に一度だけ取得し、シェルがターミナルを
/// 取り戻すたびに復元する。
pub struct Terminal {
    /// 制御端末のファイルディスクリプタ（`dup(STDIN_FILENO)` + CLOEXEC）。
    fd: i32,
    /// シェル自身のプロセスグループ ID。
    shell_pgid: pid_t,
    /// 起動時に保存したシェルの termios 設定。
    shell_tmodes: termios,
}

impl Terminal {
    /// 制御端末を初期化する。stdin が端末でなければ診断を出して終了する。
    ///
    /// 1. `isatty(stdin)` で対話モードを確認
    /// 2. fd を複製して FD_CLOEXEC を立てる
    /// 3. `tcsetpgrp` でシェル自身をフォアグラウンドにする
    /// 4. `tcgetattr` で termios をスナップショット
    pub fn new() -> Self {
        if unsafe { libc::isatty(libc::STDIN_FILENO) } == 0 {
            eprintln!("jsh: stdin is not a terminal");
            std::process::exit(1);
        }

        let fd = unsafe { libc::dup(libc::STDIN_FILENO) };
        if fd < 0 {
            fatal("dup");
        }
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }

        let shell_pgid = unsafe { libc::getpgrp() };
        if unsafe { libc::tcsetpgrp(fd, shell_pgid) } < 0 {
            fatal("tcsetpgrp");
        }

        let mut shell_tmodes: termios = unsafe { mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut shell_tmodes) } < 0 {
            fatal("tcgetattr");
        }

        Self {
            fd,
            shell_pgid,
            shell_tmodes,
        }
    }

    /// 制御端末の fd を返す。
    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// 起動時に保存したシェルの termios 設定のコピーを返す。
    /// 新規ジョブの初期 tmodes として使う。
    pub fn shell_modes(&self) -> termios {
        self.shell_tmodes
    }

    /// ターミナルの現在のフォアグラウンドプロセスグループを返す。
    pub fn foreground_pgrp(&self) -> pid_t {
        let pgrp = unsafe { libc::tcgetpgrp(self.fd) };
        if pgrp < 0 {
            fatal("tcgetpgrp");
        }
        pgrp
    }

    /// ターミナルを `pgid` に渡し、そのジョブの termios 設定を適用する。
    pub fn give_to(&self, pgid: pid_t, modes: &termios) {
        if unsafe { libc::tcsetpgrp(self.fd, pgid) } < 0 {
            fatal("tcsetpgrp");
        }
        if unsafe { libc::tcsetattr(self.fd, libc::TCSADRAIN, modes) } < 0 {
            fatal("tcsetattr");
        }
    }

    /// ターミナルをシェルに取り戻し、シェルの termios 設定を復元する。
    pub fn take_back(&self) {
        if unsafe { libc::tcsetpgrp(self.fd, self.shell_pgid) } < 0 {
            fatal("tcsetpgrp");
        }
        if unsafe { libc::tcsetattr(self.fd, libc::TCSADRAIN, &self.shell_tmodes) } < 0 {
            fatal("tcsetattr");
        }
    }

    /// 現在の termios 設定を読み取る。停止したジョブへの保存用。
    pub fn snapshot(&self) -> termios {
        let mut modes: termios = unsafe { mem::zeroed() };
        if unsafe { libc::tcgetattr(self.fd, &mut modes) } < 0 {
            fatal("tcgetattr");
        }
        modes
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
