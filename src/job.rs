//! ジョブテーブルとジョブ制御の中核。
//!
//! ジョブ = 1 つのコマンドまたはパイプラインに対応するプロセスグループ。
//! テーブルのスロット 0 ([`FG`]) がフォアグラウンド専用、1 以降が
//! バックグラウンドで、空きスロットは `None` で表す。
//!
//! 状態の取り込みは [`reap`] に集約する: `waitpid(WNOHANG)` をメインフロー
//! 側で回し、SIGCHLD ハンドラ自体はフラグを立てるだけにする。ジョブ状態を
//! 読んで待つ側は SIGCHLD をブロックした区間で「reap → 状態確認 →
//! [`suspend`](crate::signal::SigchldBlocked::suspend)」を繰り返すことで、
//! 確認と待機の間に届いた通知を取りこぼさない。

use std::io::Write;

use libc::pid_t;
use tracing::{debug, trace};

use crate::signal::{self, SigchldBlocked};
use crate::tty::Terminal;

/// フォアグラウンドスロットの番号。バックグラウンドは 1 以降。
pub const FG: usize = 0;

// ── データ構造 ───────────────────────────────────────────────────────

/// プロセスおよびジョブの状態。
///
/// ジョブの状態は「全プロセスの状態が一致したときにその値を取る」導出値
/// ([`JobTable::refresh_states`])。一致しない間は直前の値を保つため、
/// 一部だけ停止したパイプラインはまだ Stopped にならない。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Running,
    Stopped,
    Finished,
}

/// デコード済みの終了ステータス。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// 正常終了。引数は exit 値。
    Exited(i32),
    /// シグナルによる終了。引数はシグナル番号。
    Signaled(i32),
}

impl ExitStatus {
    /// シェルの終了コードとして報告する値。
    /// 正常終了は exit 値、シグナル終了はシグナル番号そのもの。
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(sig) => sig,
        }
    }
}

/// ジョブ内の個別プロセス。パイプラインの各ステージに対応する。
pub struct Proc {
    pub pid: pid_t,
    pub state: JobState,
    /// Finished になるまで `None`。
    pub status: Option<ExitStatus>,
}

/// ジョブ。プロセスグループと、パイプライン順のプロセス列を持つ。
pub struct Job {
    /// プロセスグループ ID。`kill(-pgid, sig)` の宛先。
    pub pgid: pid_t,
    /// パイプライン順（生産者が先頭、消費者が末尾）。
    pub procs: Vec<Proc>,
    /// このジョブがターミナルを持っていたときの termios 設定。
    /// フォアグラウンドから降格するときにスナップショットし、fg で復元する。
    pub tmodes: libc::termios,
    /// 導出状態。
    pub state: JobState,
    /// 表示用コマンド文字列。プロセス追加のたびに `" | "` 区切りで伸びる。
    pub command: String,
}

// ── JobTable ─────────────────────────────────────────────────────────

/// ジョブテーブル。スロットの確保・解放・移動と状態の導出を管理する。
pub struct JobTable {
    slots: Vec<Option<Job>>,
}

impl JobTable {
    /// フォアグラウンドスロットだけを持つ空のテーブルを作る。
    pub fn new() -> Self {
        Self { slots: vec![None] }
    }

    /// スロット数（空きスロットを含む）。
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// スロット `j` のジョブ。空きスロット・範囲外は `None`。
    pub fn get(&self, j: usize) -> Option<&Job> {
        self.slots.get(j).and_then(|s| s.as_ref())
    }

    fn get_mut(&mut self, j: usize) -> Option<&mut Job> {
        self.slots.get_mut(j).and_then(|s| s.as_mut())
    }

    /// 空きバックグラウンドスロットを探す。なければテーブルを 1 つ伸ばす。
    /// 低い番号から再利用し、解放済みスロットの無際限な増加を避ける。
    pub fn alloc_slot(&mut self) -> usize {
        for j in FG + 1..self.slots.len() {
            if self.slots[j].is_none() {
                return j;
            }
        }
        self.slots.push(None);
        self.slots.len() - 1
    }

    /// ジョブを登録し、スロット番号を返す。
    /// フォアグラウンドならスロット 0、バックグラウンドなら空きスロット。
    pub fn add_job(&mut self, pgid: pid_t, bg: bool, tmodes: libc::termios) -> usize {
        let j = if bg { self.alloc_slot() } else { FG };
        debug_assert!(self.slots[j].is_none(), "slot {j} already occupied");
        self.slots[j] = Some(Job {
            pgid,
            procs: Vec::new(),
            tmodes,
            state: JobState::Running,
            command: String::new(),
        });
        debug!(slot = j, pgid, "job added");
        j
    }

    /// ジョブにプロセスを追加し、コマンド文字列を伸ばす。
    pub fn add_proc(&mut self, j: usize, pid: pid_t, argv: &[String]) {
        let job = self.slots[j].as_mut().expect("add_proc on a free slot");
        if !job.command.is_empty() {
            job.command.push_str(" | ");
        }
        job.command.push_str(&argv.join(" "));
        job.procs.push(Proc {
            pid,
            state: JobState::Running,
            status: None,
        });
    }

    /// ジョブをスロット間で移動する。移動先は空きスロットでなければならない。
    /// バッファの所有権ごと移り、移動元は空きに戻る。
    pub fn move_job(&mut self, from: usize, to: usize) {
        debug_assert!(self.slots[to].is_none(), "slot {to} not free");
        self.slots[to] = self.slots[from].take();
    }

    /// スロット `j` の表示用コマンド文字列。
    pub fn command(&self, j: usize) -> Option<&str> {
        self.get(j).map(|job| job.command.as_str())
    }

    /// ジョブの導出状態を返す。Finished ならスロットを解放し、
    /// 最後のプロセス（パイプライン末尾）の終了ステータスを返す。
    pub fn take_state(&mut self, j: usize) -> (JobState, Option<ExitStatus>) {
        let state = self.slots[j]
            .as_ref()
            .expect("take_state on a free slot")
            .state;
        if state != JobState::Finished {
            return (state, None);
        }
        let job = self.slots[j].take().expect("slot emptied concurrently");
        let status = job.procs.last().and_then(|p| p.status);
        debug!(slot = j, ?status, "job reaped");
        (JobState::Finished, status)
    }

    /// fg/bg の省略時ターゲット: 最も新しい、未完了のバックグラウンドジョブ。
    pub fn most_recent_active(&self) -> Option<usize> {
        (FG + 1..self.slots.len())
            .rev()
            .find(|&j| matches!(self.get(j), Some(job) if job.state != JobState::Finished))
    }

    /// `waitpid` が報告した状態変化を該当プロセスに反映する。
    /// PID がどのジョブにも属さなければ何もしない。
    fn apply_status(&mut self, pid: pid_t, change: StatusChange) {
        for job in self.slots.iter_mut().flatten() {
            for proc in &mut job.procs {
                if proc.pid != pid {
                    continue;
                }
                match change {
                    StatusChange::Continued => proc.state = JobState::Running,
                    StatusChange::Stopped => proc.state = JobState::Stopped,
                    StatusChange::Finished(status) => {
                        proc.state = JobState::Finished;
                        proc.status = Some(status);
                    }
                }
                return;
            }
        }
    }

    /// 全ジョブの導出状態を再計算する。
    /// 全プロセスの状態が一致したジョブだけ、その値に更新する。
    fn refresh_states(&mut self) {
        for job in self.slots.iter_mut().flatten() {
            let Some(first) = job.procs.first() else {
                continue;
            };
            let state = first.state;
            if job.procs.iter().all(|p| p.state == state) && job.state != state {
                trace!(pgid = job.pgid, ?state, "job state");
                job.state = state;
            }
        }
    }
}

// ── Status Reaper ────────────────────────────────────────────────────

/// `waitpid` の raw ステータスをデコードした状態変化。
#[derive(Clone, Copy, Debug)]
enum StatusChange {
    Continued,
    Stopped,
    Finished(ExitStatus),
}

fn decode_status(raw: i32) -> StatusChange {
    if libc::WIFCONTINUED(raw) {
        StatusChange::Continued
    } else if libc::WIFSTOPPED(raw) {
        StatusChange::Stopped
    } else if libc::WIFSIGNALED(raw) {
        StatusChange::Finished(ExitStatus::Signaled(libc::WTERMSIG(raw)))
    } else {
        StatusChange::Finished(ExitStatus::Exited(libc::WEXITSTATUS(raw)))
    }
}

/// 未処理の子プロセス状態通知をすべて取り込む。
///
/// `waitpid(-1, WNOHANG | WUNTRACED | WCONTINUED)` を報告が尽きるまで回し、
/// 各プロセスの状態と終了ステータスを更新してからジョブの導出状態を
/// 再計算する。ブロックせず、呼び出し前後で errno を保存・復元する。
pub fn reap(jobs: &mut JobTable) {
    let saved_errno = errno();
    loop {
        let mut raw: libc::c_int = 0;
        let pid = unsafe {
            libc::waitpid(
                -1,
                &mut raw,
                libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED,
            )
        };
        if pid <= 0 {
            break;
        }
        let change = decode_status(raw);
        trace!(pid, ?change, "child status");
        jobs.apply_status(pid, change);
    }
    jobs.refresh_states();
    set_errno(saved_errno);
}

// ── Foreground Monitor ───────────────────────────────────────────────

/// フォアグラウンドジョブが Running でなくなるまでシェルをブロックする。
///
/// 前提: FG スロットにジョブがあり、呼び出し側が SIGCHLD をブロック済み
/// （`guard`）。ターミナルは必要ならジョブに渡し、戻る前に必ずシェルに
/// 取り戻す。
///
/// - 停止した場合: 現在の termios をジョブに保存し、空きバックグラウンド
///   スロットへ降格して `[n] suspended` を報告する。戻り値は 0。
/// - 完了した場合: 末尾プロセスの終了ステータスを終了コードに変換して返す。
pub fn monitor_job(jobs: &mut JobTable, tty: &Terminal, guard: &SigchldBlocked) -> i32 {
    {
        let job = jobs.get(FG).expect("monitor without a foreground job");
        if tty.foreground_pgrp() != job.pgid {
            tty.give_to(job.pgid, &job.tmodes);
        }
    }

    let mut exitcode = 0;
    loop {
        reap(jobs);
        let (state, status) = jobs.take_state(FG);
        match state {
            JobState::Running => guard.suspend(),
            JobState::Stopped => {
                let modes = tty.snapshot();
                if let Some(job) = jobs.get_mut(FG) {
                    job.tmodes = modes;
                }
                let to = jobs.alloc_slot();
                jobs.move_job(FG, to);
                println!("[{to}] suspended '{}'", jobs.command(to).unwrap_or(""));
                break;
            }
            JobState::Finished => {
                exitcode = status.map_or(0, ExitStatus::code);
                break;
            }
        }
    }

    tty.take_back();
    exitcode
}

// ── Resume / Kill ────────────────────────────────────────────────────

/// プロセスグループへシグナルを送る。失敗（グループ消滅など）はログのみ。
fn send_to_group(pgid: pid_t, sig: libc::c_int) {
    if unsafe { libc::kill(-pgid, sig) } < 0 {
        debug!(pgid, sig, "kill failed");
    }
}

/// 停止中（または実行中）のジョブを再開する。
///
/// `j` が `None` なら最も新しい未完了ジョブを対象にする。対象が存在しない、
/// 範囲外、または Finished なら何もせず `false` を返す。
///
/// フォアグラウンド再開: FG スロットへ移動し、保存済み termios とともに
/// ターミナルを渡し、停止中なら SIGCONT を送って Stopped を抜けるまで
/// 待ってから監視に入る。バックグラウンド再開: SIGCONT を送って報告のみ。
pub fn resume_job(jobs: &mut JobTable, tty: &Terminal, j: Option<usize>, bg: bool) -> bool {
    let guard = signal::block_sigchld();
    reap(jobs);

    let j = match j.or_else(|| jobs.most_recent_active()) {
        Some(j) => j,
        None => return false,
    };
    if j == FG || j >= jobs.len() {
        return false;
    }
    let stopped = match jobs.get(j) {
        Some(job) if job.state != JobState::Finished => job.state == JobState::Stopped,
        _ => return false,
    };

    if bg {
        let job = jobs.get(j).expect("resume target vanished");
        if stopped {
            send_to_group(job.pgid, libc::SIGCONT);
        }
        println!("[{j}] continue '{}'", job.command);
        return true;
    }

    jobs.move_job(j, FG);
    {
        let job = jobs.get(FG).expect("resume target vanished");
        tty.give_to(job.pgid, &job.tmodes);
        if stopped {
            send_to_group(job.pgid, libc::SIGCONT);
        }
    }
    while jobs.get(FG).map_or(false, |job| job.state == JobState::Stopped) {
        guard.suspend();
        reap(jobs);
    }
    println!("[{j}] continue '{}'", jobs.command(FG).unwrap_or(""));
    monitor_job(jobs, tty, &guard);
    true
}

/// ジョブに SIGTERM を送る。停止中なら SIGCONT も送り、シグナルが実際に
/// 配送されるようにする。範囲外・空き・Finished なら `false`。
pub fn kill_job(jobs: &JobTable, j: usize) -> bool {
    let Some(job) = jobs.get(j) else {
        return false;
    };
    if job.state == JobState::Finished {
        return false;
    }
    debug!(slot = j, pgid = job.pgid, "killing job");
    send_to_group(job.pgid, libc::SIGTERM);
    if job.state == JobState::Stopped {
        send_to_group(job.pgid, libc::SIGCONT);
    }
    true
}

// ── Background Reporter ──────────────────────────────────────────────

/// バックグラウンドスロットを走査し、`filter` に一致するジョブを報告する。
///
/// [`JobTable::take_state`] が Finished スロットを解放するため、これが
/// 完了ジョブの後始末も兼ねる（filter に一致しない Finished ジョブも
/// 解放される）。メッセージにはスロット解放前に複製したコマンド文字列を
/// 使う。
pub fn watch_jobs(jobs: &mut JobTable, filter: Option<JobState>, out: &mut dyn Write) {
    for j in FG + 1..jobs.len() {
        if jobs.get(j).is_none() {
            continue;
        }
        let command = jobs.command(j).unwrap_or("").to_string();
        let (state, status) = jobs.take_state(j);
        if filter.is_some_and(|f| f != state) {
            continue;
        }
        let _ = match state {
            JobState::Running => writeln!(out, "[{j}] running '{command}'"),
            JobState::Stopped => writeln!(out, "[{j}] suspended '{command}'"),
            JobState::Finished => match status {
                Some(ExitStatus::Exited(code)) => {
                    writeln!(out, "[{j}] exited '{command}', status={code}")
                }
                Some(ExitStatus::Signaled(sig)) => {
                    writeln!(out, "[{j}] killed '{command}' by signal {sig}")
                }
                None => Ok(()),
            },
        };
    }
    let _ = out.flush();
}

// ── Shutdown ─────────────────────────────────────────────────────────

/// 残っているジョブをすべて終了させ、最終報告を出す。
///
/// SIGCHLD をブロックした上で各ジョブに SIGTERM（停止中なら SIGCONT も）を
/// 送り、Finished になるまで suspend で待つ。全ジョブ終了後に Finished の
/// 報告をまとめて出力する。
pub fn shutdown_jobs(jobs: &mut JobTable, out: &mut dyn Write) {
    let guard = signal::block_sigchld();
    reap(jobs);

    for j in 0..jobs.len() {
        if !kill_job(jobs, j) {
            continue;
        }
        while jobs.get(j).map_or(false, |job| job.state != JobState::Finished) {
            guard.suspend();
            reap(jobs);
        }
    }

    watch_jobs(jobs, Some(JobState::Finished), out);
}

// ── errno ────────────────────────────────────────────────────────────

fn errno() -> i32 {
    unsafe { *errno_loc() }
}

fn set_errno(value: i32) {
    unsafe { *errno_loc() = value }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_loc() -> *mut i32 {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_loc() -> *mut i32 {
    libc::__error()
}

// ── Tests ───────────────────────────────────────────────────────────
