//! 行エディタ: raw モードでの 1 行読み取り。
//!
//! プロンプトごとにターミナルを raw モードへ切り替え、キー入力を自前で
//! 解釈する。raw モードは [`RawMode`] の RAII ガードで管理し、
//! `read_line` を抜けるとき（正常・パニックを問わず）に元の termios が
//! 復元されるため、コマンド実行中の子プロセスには通常の cooked モードが
//! 見える。
//!
//! ISIG を落としているので Ctrl+C はキー入力として届き、編集中の行を
//! 破棄して新しいプロンプトを出す。`kill -INT` のように非同期に届いた
//! SIGINT はハンドラのフラグと EINTR で検出し、[`ReadOutcome::Interrupted`]
//! として呼び出し元（REPL ループ）に返す。どちらの経路でも入力中の行は
//! 捨てられ、シェル自体は終了しない。

use std::io;

use crate::history::History;
use crate::signal;

/// `read_line` の結果。
pub enum ReadOutcome {
    /// Enter で確定した 1 行。
    Line(String),
    /// EOF（空バッファでの Ctrl+D、または端末のクローズ）。
    Eof,
    /// SIGINT により中断。入力中の行は破棄済み。
    Interrupted,
}

// ── RawMode ガード ────────────────────────────────────────────────

/// raw モードの RAII ガード。Drop で保存した termios を復元する。
///
/// ECHO / ICANON / ISIG / IEXTEN を落として 1 バイトずつ受け取る。
/// OPOST は残し、`\n` → `\r\n` の変換は端末に任せる。
struct RawMode {
    saved: libc::termios,
    fd: i32,
}

impl RawMode {
    fn enable(fd: i32) -> Self {
        let mut saved: libc::termios = unsafe { std::mem::zeroed() };
        unsafe {
            libc::tcgetattr(fd, &mut saved);
        }
        let mut raw = saved;
        raw.c_iflag &= !(libc::BRKINT | libc::ICRNL | libc::INPCK | libc::ISTRIP | libc::IXON);
        raw.c_cflag |= libc::CS8;
        raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::IEXTEN | libc::ISIG);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;
        // TCSADRAIN: フォアグラウンドジョブ実行中に打たれた先行入力を捨てない
        unsafe {
            libc::tcsetattr(fd, libc::TCSADRAIN, &raw);
        }
        Self { saved, fd }
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSADRAIN, &self.saved);
        }
    }
}

// ── キー入力 ──────────────────────────────────────────────────────

/// 解釈済みのキー入力。
enum Key {
    Char(char),
    Enter,
    Backspace,
    Delete,
    Left,
    Right,
    Up,
    Down,
    Home,
    End,
    CtrlA,
    CtrlC,
    CtrlD,
    CtrlE,
    CtrlK,
    CtrlL,
    CtrlU,
    CtrlW,
    /// read が 0 バイトを返した（端末クローズ）。
    Eof,
    /// SIGINT による EINTR。
    Interrupted,
    /// 未対応のバイト列。無視する。
    Unknown,
}

enum ByteRead {
    Byte(u8),
    Eof,
    Interrupted,
}

/// 1 バイト読む。SIGINT 以外のシグナルによる EINTR はリトライする。
fn read_byte(fd: i32) -> ByteRead {
    loop {
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
        if n == 1 {
            return ByteRead::Byte(buf[0]);
        }
        if n == 0 {
            return ByteRead::Eof;
        }
        if signal::take_sigint() {
            return ByteRead::Interrupted;
        }
        if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return ByteRead::Eof;
    }
}

/// ESC に続くシーケンスを解釈する。`poll` で後続バイトの有無を確認し、
/// 50ms 以内に何も来なければ ESC 単独とみなして無視する。
fn read_escape(fd: i32) -> Key {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    if unsafe { libc::poll(&mut pfd, 1, 50) } <= 0 {
        return Key::Unknown;
    }

    let ByteRead::Byte(b'[') = read_byte(fd) else {
        return Key::Unknown;
    };
    let ByteRead::Byte(code) = read_byte(fd) else {
        return Key::Unknown;
    };
    match code {
        b'A' => Key::Up,
        b'B' => Key::Down,
        b'C' => Key::Right,
        b'D' => Key::Left,
        b'H' => Key::Home,
        b'F' => Key::End,
        b'1' | b'3' | b'4' => {
            // VT 形式 `ESC [ N ~`
            let ByteRead::Byte(b'~') = read_byte(fd) else {
                return Key::Unknown;
            };
            match code {
                b'1' => Key::Home,
                b'3' => Key::Delete,
                _ => Key::End,
            }
        }
        _ => Key::Unknown,
    }
}

/// UTF-8 マルチバイト文字の残りを読み取る。
fn read_utf8(fd: i32, first: u8, len: usize) -> Key {
    let mut buf = [0u8; 4];
    buf[0] = first;
    for slot in buf.iter_mut().take(len).skip(1) {
        let ByteRead::Byte(b) = read_byte(fd) else {
            return Key::Unknown;
        };
        *slot = b;
    }
    match std::str::from_utf8(&buf[..len]) {
        Ok(s) => s.chars().next().map_or(Key::Unknown, Key::Char),
        Err(_) => Key::Unknown,
    }
}

/// 1 キー分のバイト列を読み取って [`Key`] に解釈する。
fn read_key(fd: i32) -> Key {
    let byte = match read_byte(fd) {
        ByteRead::Byte(b) => b,
        ByteRead::Eof => return Key::Eof,
        ByteRead::Interrupted => return Key::Interrupted,
    };

    match byte {
        b'\r' | b'\n' => Key::Enter,
        0x7f | 0x08 => Key::Backspace,
        0x1b => read_escape(fd),
        1 => Key::CtrlA,
        3 => Key::CtrlC,
        4 => Key::CtrlD,
        5 => Key::CtrlE,
        11 => Key::CtrlK,
        12 => Key::CtrlL,
        21 => Key::CtrlU,
        23 => Key::CtrlW,
        b if (32..127).contains(&b) => Key::Char(b as char),
        b if b & 0xe0 == 0xc0 => read_utf8(fd, b, 2),
        b if b & 0xf0 == 0xe0 => read_utf8(fd, b, 3),
        b if b & 0xf8 == 0xf0 => read_utf8(fd, b, 4),
        _ => Key::Unknown,
    }
}

// ── LineEditor ────────────────────────────────────────────────────

/// 行エディタ。入力バッファ・カーソル位置・履歴を保持する。
pub struct LineEditor {
    /// 編集中のテキスト。
    buf: String,
    /// カーソルのバイトオフセット。常に UTF-8 文字境界上。
    cursor: usize,
    /// コマンド履歴。
    history: History,
    fd: i32,
}

impl LineEditor {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            cursor: 0,
            history: History::new(),
            fd: libc::STDIN_FILENO,
        }
    }

    /// 確定した行を履歴に追加する。
    pub fn add_history(&mut self, line: &str) {
        self.history.add(line);
    }

    /// プロンプトを出して 1 行読み取る。
    pub fn read_line(&mut self, prompt: &str) -> ReadOutcome {
        self.buf.clear();
        self.cursor = 0;
        self.history.reset();

        let _raw = RawMode::enable(self.fd);
        self.redraw(prompt);

        loop {
            match read_key(self.fd) {
                Key::Enter => {
                    term_write("\n");
                    return ReadOutcome::Line(self.buf.clone());
                }
                Key::Eof => {
                    term_write("\n");
                    return ReadOutcome::Eof;
                }
                Key::CtrlD => {
                    if self.buf.is_empty() {
                        term_write("\n");
                        return ReadOutcome::Eof;
                    }
                }
                Key::Interrupted => {
                    term_write("\n");
                    return ReadOutcome::Interrupted;
                }
                Key::CtrlC => {
                    // 入力中の行を破棄して新しいプロンプトへ
                    term_write("^C\n");
                    self.buf.clear();
                    self.cursor = 0;
                    self.history.reset();
                }
                Key::Char(ch) => self.insert(ch),
                Key::Backspace => self.backspace(),
                Key::Delete => self.delete_at_cursor(),
                Key::Left => self.move_left(),
                Key::Right => self.move_right(),
                Key::Home | Key::CtrlA => self.cursor = 0,
                Key::End | Key::CtrlE => self.cursor = self.buf.len(),
                Key::Up => {
                    if let Some(entry) = self.history.prev(&self.buf) {
                        self.buf = entry;
                        self.cursor = self.buf.len();
                    }
                }
                Key::Down => {
                    if let Some(entry) = self.history.next() {
                        self.buf = entry;
                        self.cursor = self.buf.len();
                    }
                }
                Key::CtrlK => self.buf.truncate(self.cursor),
                Key::CtrlU => {
                    self.buf.drain(..self.cursor);
                    self.cursor = 0;
                }
                Key::CtrlW => self.kill_prev_word(),
                Key::CtrlL => term_write("\x1b[2J\x1b[H"),
                Key::Unknown => continue,
            }
            self.redraw(prompt);
        }
    }

    // ── バッファ操作 ──────────────────────────────────────────────

    /// カーソル直前の文字の開始バイト位置。行頭なら `None`。
    fn prev_boundary(&self) -> Option<usize> {
        self.buf[..self.cursor].char_indices().next_back().map(|(i, _)| i)
    }

    fn insert(&mut self, ch: char) {
        self.buf.insert(self.cursor, ch);
        self.cursor += ch.len_utf8();
    }

    fn backspace(&mut self) {
        if let Some(start) = self.prev_boundary() {
            self.buf.remove(start);
            self.cursor = start;
        }
    }

    fn delete_at_cursor(&mut self) {
        if self.cursor < self.buf.len() {
            self.buf.remove(self.cursor);
        }
    }

    fn move_left(&mut self) {
        if let Some(start) = self.prev_boundary() {
            self.cursor = start;
        }
    }

    fn move_right(&mut self) {
        if let Some(ch) = self.buf[self.cursor..].chars().next() {
            self.cursor += ch.len_utf8();
        }
    }

    /// Ctrl+W: カーソル直前の空白の並びと 1 単語を削除する。
    fn kill_prev_word(&mut self) {
        let head = &self.buf[..self.cursor];
        let trimmed = head.trim_end_matches(' ');
        let start = trimmed.rfind(' ').map_or(0, |i| i + 1);
        self.buf.drain(start..self.cursor);
        self.cursor = start;
    }

    // ── 表示 ──────────────────────────────────────────────────────

    /// 行全体を描き直す。1 回の write にまとめてフリッカーを防ぐ。
    fn redraw(&self, prompt: &str) {
        let tail = self.buf[self.cursor..].chars().count();
        let mut out = String::with_capacity(prompt.len() + self.buf.len() + 16);
        out.push('\r');
        out.push_str(prompt);
        out.push_str(&self.buf);
        out.push_str("\x1b[K");
        if tail > 0 {
            out.push_str(&format!("\x1b[{tail}D"));
        }
        term_write(&out);
    }
}

/// Rust 側のバッファを介さず stdout に直接書く。
fn term_write(s: &str) {
    let bytes = s.as_bytes();
    let mut done = 0;
    while done < bytes.len() {
        let n = unsafe {
            libc::write(
                libc::STDOUT_FILENO,
                bytes[done..].as_ptr() as *const libc::c_void,
                bytes.len() - done,
            )
        };
        if n <= 0 {
            break;
        }
        done += n as usize;
    }
}

// ── Tests ─────────────────────────────────────────────────────────
