//! シグナル設定とマスク操作。
//!
//! シェル本体のシグナル方針:
//! - SIGCHLD: フラグを立てるだけのハンドラ。状態の取り込みは
//!   [`job::reap`](crate::job::reap) がメインフロー側で行う。
//! - SIGINT: フラグを立てるだけのハンドラ（`SA_RESTART` なし）。
//!   行エディタのブロッキング read を EINTR で中断させ、入力中の行を
//!   破棄してプロンプトに戻るために使う。
//! - SIGTSTP / SIGTTIN / SIGTTOU: 無視。シェル自身が停止しないため。
//!
//! 子プロセス側は [`reset_child_dispositions`] で 4 シグナルすべてを
//! デフォルトに戻す（外部コマンドは `spawn` の属性で同じことを行う）。
//!
//! [`SigchldBlocked`] は SIGCHLD をブロックする RAII ガードで、
//! ブロック前のマスクを保持する。[`SigchldBlocked::suspend`] が
//! そのマスクで `sigsuspend` する（アンブロック + 待機 + 再ブロックを
//! 原子的に行う中断プリミティブ）。待機判断と待機の間に届いた SIGCHLD は
//! ペンディングのまま保留され、suspend が即座に返るため取りこぼしがない。

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::c_int;

use crate::fatal;

static SIGCHLD_SEEN: AtomicBool = AtomicBool::new(false);
static SIGINT_SEEN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigchld(_: c_int) {
    // async-signal-safe: アトミックストアのみ（errno にも触れない）
    SIGCHLD_SEEN.store(true, Ordering::Relaxed);
}

extern "C" fn on_sigint(_: c_int) {
    SIGINT_SEEN.store(true, Ordering::Relaxed);
}

/// 前回の呼び出し以降に SIGCHLD が届いたかを返し、フラグを下ろす。
pub fn take_sigchld() -> bool {
    SIGCHLD_SEEN.swap(false, Ordering::Relaxed)
}

/// 前回の呼び出し以降に SIGINT が届いたかを返し、フラグを下ろす。
pub fn take_sigint() -> bool {
    SIGINT_SEEN.swap(false, Ordering::Relaxed)
}

/// `sigaction` でハンドラを設定する。
fn install_handler(sig: c_int, handler: extern "C" fn(c_int), flags: c_int) {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler as libc::sighandler_t;
        sa.sa_flags = flags;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, ptr::null_mut()) < 0 {
            fatal("sigaction");
        }
    }
}

/// シェルのシグナル方針を一括設定する。起動時に一度だけ呼ぶ。
pub fn install() {
    // SIGCHLD はフラグのみ。SA_RESTART で行エディタの read を乱さない。
    install_handler(libc::SIGCHLD, on_sigchld, libc::SA_RESTART);
    // SIGINT は read を EINTR で中断させたいので SA_RESTART なし。
    install_handler(libc::SIGINT, on_sigint, 0);
    unsafe {
        libc::signal(libc::SIGTSTP, libc::SIG_IGN);
        libc::signal(libc::SIGTTIN, libc::SIG_IGN);
        libc::signal(libc::SIGTTOU, libc::SIG_IGN);
    }
}

/// fork した子で SIGINT / SIGTSTP / SIGTTIN / SIGTTOU をデフォルトに戻す。
pub fn reset_child_dispositions() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
        libc::signal(libc::SIGTSTP, libc::SIG_DFL);
        libc::signal(libc::SIGTTIN, libc::SIG_DFL);
        libc::signal(libc::SIGTTOU, libc::SIG_DFL);
    }
}

// ── SIGCHLD ブロックガード ───────────────────────────────────────────

/// SIGCHLD をブロックする RAII ガード。Drop で元のマスクを復元する。
///
/// ジョブ状態を読んで行動を決める区間（spawn からの登録、フォアグラウンド
/// 監視、fg/bg、シャットダウン）はこのガード下で実行する。
/// ガードを入れ子にしてはならない: 入れ子の内側では「ブロック前のマスク」に
/// SIGCHLD が含まれてしまい、[`suspend`](Self::suspend) が永久に起きない。
pub struct SigchldBlocked {
    /// ブロック前のシグナルマスク。suspend と Drop で使う。
    prev: libc::sigset_t,
}

/// SIGCHLD をブロックし、解除用のガードを返す。
pub fn block_sigchld() -> SigchldBlocked {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
        let mut prev: libc::sigset_t = mem::zeroed();
        if libc::sigprocmask(libc::SIG_BLOCK, &set, &mut prev) < 0 {
            fatal("sigprocmask");
        }
        SigchldBlocked { prev }
    }
}

impl SigchldBlocked {
    /// ブロック前のマスクで `sigsuspend` する。
    ///
    /// 「SIGCHLD を一度だけ許可して待ち、戻るときには再びブロックされて
    /// いる」ことをカーネルが保証する。戻り値は常に EINTR なので見ない。
    pub fn suspend(&self) {
        unsafe {
            libc::sigsuspend(&self.prev);
        }
    }

    /// ブロック前のマスクへの参照。子プロセスのマスク初期化に使う。
    pub fn prev_mask(&self) -> &libc::sigset_t {
        &self.prev
    }

    /// fork した子でブロック前のマスクを復元する。
    pub fn restore_in_child(&self) {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &self.prev, ptr::null_mut());
        }
    }
}

impl Drop for SigchldBlocked {
    fn drop(&mut self) {
        unsafe {
            if libc::sigprocmask(libc::SIG_SETMASK, &self.prev, ptr::null_mut()) < 0 {
                fatal("sigprocmask");
            }
        }
    }
}
