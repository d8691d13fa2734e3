//! `posix_spawnp()` の安全な Rust ラッパー。
//!
//! 外部コマンドの起動エンジン。fork + exec の手書きシーケンスの代わりに
//! `posix_spawnp` の属性とファイルアクションで子プロセスの初期状態を
//! 組み立てる:
//!
//! - プロセスグループ: `POSIX_SPAWN_SETPGROUP`（`pgid == 0` なら子自身が
//!   グループリーダーになる）。exec より前にカーネルが適用するため、
//!   「グループがまだ存在しない」瞬間を子側で作らない
//! - シグナル: `POSIX_SPAWN_SETSIGDEF` で SIGINT/SIGTSTP/SIGTTOU/SIGTTIN を
//!   デフォルトに戻し、`POSIX_SPAWN_SETSIGMASK` で SIGCHLD ブロック前の
//!   マスクを復元する（executor は SIGCHLD をブロックした状態で spawn する）
//! - fd: `dup2` アクションでリダイレクト・パイプ端を stdin/stdout に重ね、
//!   残ったパイプ端は `close` アクションで閉じる

use std::ffi::CString;

use thiserror::Error;

// ── エラー型 ──────────────────────────────────────────────────────

/// `posix_spawnp` の失敗。errno を対応する終了ステータスに写像する。
#[derive(Debug, Error)]
#[error("{command}: {reason}")]
pub struct SpawnError {
    /// コマンド名（エラーメッセージ用）。
    pub command: String,
    reason: &'static str,
    errno: i32,
}

impl SpawnError {
    fn new(errno: i32, command: &str) -> Self {
        let reason = match errno {
            libc::ENOENT => "command not found",
            libc::EACCES => "permission denied",
            _ => "spawn failed",
        };
        Self {
            command: command.to_string(),
            reason,
            errno,
        }
    }

    /// エラーに対応する終了ステータス。
    /// 127 = command not found, 126 = permission denied, 1 = その他。
    pub fn exit_status(&self) -> i32 {
        match self.errno {
            libc::ENOENT => 127,
            libc::EACCES => 126,
            _ => 1,
        }
    }
}

// ── SpawnAttr ─────────────────────────────────────────────────────

/// `posix_spawnattr_t` の RAII ラッパー。Drop で自動 destroy。
struct SpawnAttr {
    inner: libc::posix_spawnattr_t,
}

impl SpawnAttr {
    fn new() -> Self {
        unsafe {
            let mut attr: libc::posix_spawnattr_t = std::mem::zeroed();
            libc::posix_spawnattr_init(&mut attr);
            Self { inner: attr }
        }
    }

    fn add_flag(&mut self, flag: libc::c_int) {
        unsafe {
            let mut flags: libc::c_short = 0;
            libc::posix_spawnattr_getflags(&self.inner, &mut flags);
            flags |= flag as libc::c_short;
            libc::posix_spawnattr_setflags(&mut self.inner, flags);
        }
    }

    /// 子のプロセスグループを設定する。`pgid == 0` なら子自身がリーダー。
    fn set_pgroup(&mut self, pgid: libc::pid_t) {
        self.add_flag(libc::POSIX_SPAWN_SETPGROUP);
        unsafe {
            libc::posix_spawnattr_setpgroup(&mut self.inner, pgid);
        }
    }

    /// ジョブ制御系シグナルを子でデフォルトに戻す。
    fn set_sigdefault(&mut self) {
        self.add_flag(libc::POSIX_SPAWN_SETSIGDEF);
        unsafe {
            let mut sigset: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut sigset);
            libc::sigaddset(&mut sigset, libc::SIGINT);
            libc::sigaddset(&mut sigset, libc::SIGTSTP);
            libc::sigaddset(&mut sigset, libc::SIGTTOU);
            libc::sigaddset(&mut sigset, libc::SIGTTIN);
            libc::posix_spawnattr_setsigdefault(&mut self.inner, &sigset);
        }
    }

    /// 子のシグナルマスクを設定する。親が SIGCHLD をブロックしたまま
    /// spawn するため、子にはブロック前のマスクを渡す。
    fn set_sigmask(&mut self, mask: &libc::sigset_t) {
        self.add_flag(libc::POSIX_SPAWN_SETSIGMASK);
        unsafe {
            libc::posix_spawnattr_setsigmask(&mut self.inner, mask);
        }
    }

    fn as_ptr(&self) -> *const libc::posix_spawnattr_t {
        &self.inner
    }
}

impl Drop for SpawnAttr {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawnattr_destroy(&mut self.inner);
        }
    }
}

// ── FileActions ───────────────────────────────────────────────────

/// `posix_spawn_file_actions_t` の RAII ラッパー。Drop で自動 destroy。
struct FileActions {
    inner: libc::posix_spawn_file_actions_t,
}

impl FileActions {
    fn new() -> Self {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            libc::posix_spawn_file_actions_init(&mut actions);
            Self { inner: actions }
        }
    }

    /// `dup2(fd, newfd)` アクション。リダイレクト・パイプ接続用。
    fn add_dup2(&mut self, fd: i32, newfd: i32) {
        unsafe {
            libc::posix_spawn_file_actions_adddup2(&mut self.inner, fd, newfd);
        }
    }

    /// `close(fd)` アクション。子に渡さないパイプ端のクローズ用。
    fn add_close(&mut self, fd: i32) {
        unsafe {
            libc::posix_spawn_file_actions_addclose(&mut self.inner, fd);
        }
    }

    fn as_ptr(&self) -> *const libc::posix_spawn_file_actions_t {
        &self.inner
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawn_file_actions_destroy(&mut self.inner);
        }
    }
}

// ── CStringVec ────────────────────────────────────────────────────

/// argv 用の CString ベクタ。NULL 終端のポインタ配列を構築する。
struct CStringVec {
    _strings: Vec<CString>,
    ptrs: Vec<*mut libc::c_char>,
}

impl CStringVec {
    fn from_args(args: &[String]) -> Self {
        let strings: Vec<CString> = args
            .iter()
            .map(|s| CString::new(s.as_str()).unwrap_or_else(|_| CString::default()))
            .collect();
        let mut ptrs: Vec<*mut libc::c_char> = strings
            .iter()
            .map(|s| s.as_ptr() as *mut libc::c_char)
            .collect();
        ptrs.push(std::ptr::null_mut());
        Self {
            _strings: strings,
            ptrs,
        }
    }

    /// argv[0] のポインタ。`posix_spawnp` の path 引数に使う。
    fn file(&self) -> *const libc::c_char {
        self.ptrs[0]
    }

    fn as_ptr(&self) -> *const *mut libc::c_char {
        self.ptrs.as_ptr()
    }
}

// ── spawn 関数 ────────────────────────────────────────────────────

/// `posix_spawnp` で外部コマンドを起動する。成功時は子の PID を返す。
///
/// - `args`: コマンドと引数（`args[0]` が PATH 検索されるコマンド名）
/// - `pgid`: 参加するプロセスグループ（0 なら子がリーダーになる）
/// - `stdin_fd` / `stdout_fd`: リダイレクトまたはパイプ端（`None` は継承）
/// - `fds_to_close`: 子で閉じる fd（後続ステージ用パイプの端など）
/// - `child_mask`: 子に設定するシグナルマスク（SIGCHLD ブロック前のもの）
pub fn spawn(
    args: &[String],
    pgid: libc::pid_t,
    stdin_fd: Option<i32>,
    stdout_fd: Option<i32>,
    fds_to_close: &[i32],
    child_mask: &libc::sigset_t,
) -> Result<libc::pid_t, SpawnError> {
    let argv = CStringVec::from_args(args);

    let mut attr = SpawnAttr::new();
    attr.set_pgroup(pgid);
    attr.set_sigdefault();
    attr.set_sigmask(child_mask);

    let mut actions = FileActions::new();
    if let Some(fd) = stdin_fd {
        actions.add_dup2(fd, libc::STDIN_FILENO);
        if fd != libc::STDIN_FILENO {
            actions.add_close(fd);
        }
    }
    if let Some(fd) = stdout_fd {
        actions.add_dup2(fd, libc::STDOUT_FILENO);
        if fd != libc::STDOUT_FILENO {
            actions.add_close(fd);
        }
    }
    for &fd in fds_to_close {
        if fd < 0 {
            continue;
        }
        // dup2 アクションで既にクローズされる fd は重ねて閉じない
        let already_closed = [stdin_fd, stdout_fd]
            .iter()
            .any(|&redir_fd| redir_fd == Some(fd));
        if !already_closed {
            actions.add_close(fd);
        }
    }

    // environ をそのまま継承する
    extern "C" {
        static environ: *const *mut libc::c_char;
    }

    let mut pid: libc::pid_t = 0;
    let ret = unsafe {
        libc::posix_spawnp(
            &mut pid,
            argv.file(),
            actions.as_ptr(),
            attr.as_ptr(),
            argv.as_ptr(),
            environ as *const *mut libc::c_char,
        )
    };

    if ret != 0 {
        return Err(SpawnError::new(ret, &args[0]));
    }

    tracing::debug!(pid, pgid, command = %args[0], "spawned");
    Ok(pid)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_maps_exit_status() {
        assert_eq!(SpawnError::new(libc::ENOENT, "nope").exit_status(), 127);
        assert_eq!(SpawnError::new(libc::EACCES, "nope").exit_status(), 126);
        assert_eq!(SpawnError::new(libc::ENOMEM, "nope").exit_status(), 1);
    }

    #[test]
    fn spawn_error_message_names_the_command() {
        let err = SpawnError::new(libc::ENOENT, "no-such-cmd");
        assert_eq!(err.to_string(), "no-such-cmd: command not found");
    }
}
