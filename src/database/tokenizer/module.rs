//! FTS3 tokenizer module binding
//!
//! The engine's full-text extension consumes tokenizers through a fixed C
//! structure of function pointers (`sqlite3_tokenizer_module` in
//! `fts3_tokenizer.h`). [`TokenizerModule`] reproduces that layout and
//! forwards every call to an [`FtsTokenizer`]:
//!
//! - `xCreate` boxes a tokenizer instance owned by the engine
//! - `xOpen` tokenizes one input buffer into a cursor
//! - `xNext` hands out the cursor's tokens one by one
//! - `xClose`/`xDestroy` drop the cursor and the tokenizer
//!
//! Registration goes through `SELECT fts3_tokenizer(name, pointer)`, with the
//! address of a `'static` module passed as a pointer-sized blob.

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use anyhow::{anyhow, Result};
use rusqlite::config::DbConfig;
use rusqlite::ffi::{SQLITE_DONE, SQLITE_ERROR, SQLITE_OK};
use rusqlite::{params, Connection};
use tracing::debug;

use super::{tokenize_bytes, FtsTokenizer, Token, UnicodeTokenizer};

// ── C layout ────────────────────────────────────────────────────────

/// Base of every tokenizer instance handed to the engine.
#[repr(C)]
struct Sqlite3Tokenizer {
    p_module: *const TokenizerModule,
}

/// Base of every cursor handed to the engine.
#[repr(C)]
struct Sqlite3TokenizerCursor {
    p_tokenizer: *mut Sqlite3Tokenizer,
}

type CreateFn = unsafe extern "C" fn(
    argc: c_int,
    argv: *const *const c_char,
    pp_tokenizer: *mut *mut Sqlite3Tokenizer,
) -> c_int;
type DestroyFn = unsafe extern "C" fn(p_tokenizer: *mut Sqlite3Tokenizer) -> c_int;
type OpenFn = unsafe extern "C" fn(
    p_tokenizer: *mut Sqlite3Tokenizer,
    p_input: *const c_char,
    n_bytes: c_int,
    pp_cursor: *mut *mut Sqlite3TokenizerCursor,
) -> c_int;
type CloseFn = unsafe extern "C" fn(p_cursor: *mut Sqlite3TokenizerCursor) -> c_int;
type NextFn = unsafe extern "C" fn(
    p_cursor: *mut Sqlite3TokenizerCursor,
    pp_token: *mut *const c_char,
    pn_bytes: *mut c_int,
    pi_start_offset: *mut c_int,
    pi_end_offset: *mut c_int,
    pi_position: *mut c_int,
) -> c_int;

/// `sqlite3_tokenizer_module`, version 0.
#[repr(C)]
pub struct TokenizerModule {
    i_version: c_int,
    x_create: CreateFn,
    x_destroy: DestroyFn,
    x_open: OpenFn,
    x_close: CloseFn,
    x_next: NextFn,
}

impl TokenizerModule {
    /// Module whose instances are `T::default()`.
    pub const fn new<T: FtsTokenizer + Default + 'static>() -> Self {
        Self {
            i_version: 0,
            x_create: x_create::<T>,
            x_destroy,
            x_open,
            x_close,
            x_next,
        }
    }
}

/// Module backing `tokenize=unicode`
pub static UNICODE_TOKENIZER_MODULE: TokenizerModule = TokenizerModule::new::<UnicodeTokenizer>();

// ── Rust-side state ─────────────────────────────────────────────────

/// Tokenizer instance owned by the engine between `xCreate` and `xDestroy`.
#[repr(C)]
struct TokenizerState {
    base: Sqlite3Tokenizer,
    tokenizer: Box<dyn FtsTokenizer>,
}

/// Cursor owned by the engine between `xOpen` and `xClose`.
#[repr(C)]
struct CursorState {
    base: Sqlite3TokenizerCursor,
    cursor: TokenCursor,
}

/// Tokens of one input buffer, handed out in order.
#[derive(Debug, Default)]
pub struct TokenCursor {
    tokens: Vec<Token>,
    position: usize,
    /// UTF-8 of the token returned last; must outlive the next `xNext` call
    current: Vec<u8>,
}

impl TokenCursor {
    pub fn open(tokenizer: &dyn FtsTokenizer, input: &[u8]) -> Self {
        Self {
            tokens: tokenize_bytes(tokenizer, input),
            position: 0,
            current: Vec::new(),
        }
    }

    /// Advance to the next token, returning `(term, token, position)`.
    pub fn next_token(&mut self) -> Option<(&[u8], &Token, usize)> {
        let token = self.tokens.get(self.position)?;
        let position = self.position;
        self.position += 1;
        self.current.clear();
        self.current.extend_from_slice(token.text.as_bytes());
        Some((self.current.as_slice(), token, position))
    }
}

// ── Callbacks ───────────────────────────────────────────────────────

unsafe extern "C" fn x_create<T: FtsTokenizer + Default + 'static>(
    _argc: c_int,
    _argv: *const *const c_char,
    pp_tokenizer: *mut *mut Sqlite3Tokenizer,
) -> c_int {
    if pp_tokenizer.is_null() {
        return SQLITE_ERROR;
    }

    let state = Box::new(TokenizerState {
        base: Sqlite3Tokenizer {
            p_module: ptr::null(),
        },
        tokenizer: Box::new(T::default()),
    });
    *pp_tokenizer = Box::into_raw(state).cast::<Sqlite3Tokenizer>();
    SQLITE_OK
}

unsafe extern "C" fn x_destroy(p_tokenizer: *mut Sqlite3Tokenizer) -> c_int {
    if !p_tokenizer.is_null() {
        drop(Box::from_raw(p_tokenizer.cast::<TokenizerState>()));
    }
    SQLITE_OK
}

unsafe extern "C" fn x_open(
    p_tokenizer: *mut Sqlite3Tokenizer,
    p_input: *const c_char,
    n_bytes: c_int,
    pp_cursor: *mut *mut Sqlite3TokenizerCursor,
) -> c_int {
    if p_tokenizer.is_null() || pp_cursor.is_null() {
        return SQLITE_ERROR;
    }

    let state = &*p_tokenizer.cast::<TokenizerState>();
    let input: &[u8] = if p_input.is_null() {
        &[]
    } else if n_bytes < 0 {
        // Negative length means the input is nul-terminated
        CStr::from_ptr(p_input).to_bytes()
    } else {
        std::slice::from_raw_parts(p_input.cast::<u8>(), n_bytes as usize)
    };

    let opened = catch_unwind(AssertUnwindSafe(|| {
        TokenCursor::open(state.tokenizer.as_ref(), input)
    }));
    let cursor = match opened {
        Ok(cursor) => cursor,
        Err(_) => return SQLITE_ERROR,
    };

    let cursor = Box::new(CursorState {
        base: Sqlite3TokenizerCursor { p_tokenizer },
        cursor,
    });
    *pp_cursor = Box::into_raw(cursor).cast::<Sqlite3TokenizerCursor>();
    SQLITE_OK
}

unsafe extern "C" fn x_close(p_cursor: *mut Sqlite3TokenizerCursor) -> c_int {
    if !p_cursor.is_null() {
        drop(Box::from_raw(p_cursor.cast::<CursorState>()));
    }
    SQLITE_OK
}

unsafe extern "C" fn x_next(
    p_cursor: *mut Sqlite3TokenizerCursor,
    pp_token: *mut *const c_char,
    pn_bytes: *mut c_int,
    pi_start_offset: *mut c_int,
    pi_end_offset: *mut c_int,
    pi_position: *mut c_int,
) -> c_int {
    if p_cursor.is_null() {
        return SQLITE_ERROR;
    }

    let state = &mut *p_cursor.cast::<CursorState>();
    let Some((term, token, position)) = state.cursor.next_token() else {
        return SQLITE_DONE;
    };

    if !pp_token.is_null() {
        *pp_token = term.as_ptr().cast::<c_char>();
    }
    if !pn_bytes.is_null() {
        *pn_bytes = term.len() as c_int;
    }
    if !pi_start_offset.is_null() {
        *pi_start_offset = token.start as c_int;
    }
    if !pi_end_offset.is_null() {
        *pi_end_offset = token.end as c_int;
    }
    if !pi_position.is_null() {
        *pi_position = position as c_int;
    }
    SQLITE_OK
}

// ── Registration ────────────────────────────────────────────────────

/// Register `module` with the connection's FTS3 extension under `name`.
///
/// Must run on every new connection before any FTS3 table using
/// `tokenize=<name>` is created or queried.
pub fn register_tokenizer(
    conn: &Connection,
    name: &str,
    module: &'static TokenizerModule,
) -> Result<()> {
    // The two-argument form of fts3_tokenizer() is disabled by default
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FTS3_TOKENIZER, true)
        .map_err(|e| anyhow!("Failed to enable fts3_tokenizer(): {}", e))?;

    let address = (module as *const TokenizerModule as usize).to_ne_bytes();
    let registered = conn
        .query_row(
            "SELECT fts3_tokenizer(?1, ?2)",
            params![name, &address[..]],
            |_| Ok(()),
        )
        .map_err(|e| anyhow!("Failed to register FTS3 tokenizer '{}': {}", name, e));

    // Registered tokenizers stay usable; only new registrations need the flag
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FTS3_TOKENIZER, false)
        .map_err(|e| anyhow!("Failed to disable fts3_tokenizer(): {}", e))?;
    registered?;

    debug!("registered FTS3 tokenizer '{}'", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tokenizer::UNICODE_TOKENIZER_NAME;

    fn fts_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        register_tokenizer(&conn, UNICODE_TOKENIZER_NAME, &UNICODE_TOKENIZER_MODULE).unwrap();
        conn.execute_batch(
            "CREATE VIRTUAL TABLE songs_fts USING fts3(ftstitle, ftsartist, tokenize=unicode);
             INSERT INTO songs_fts (rowid, ftstitle, ftsartist) VALUES (1, 'Café del Mar', 'Energy 52');
             INSERT INTO songs_fts (rowid, ftstitle, ftsartist) VALUES (2, 'Ace of Spades', 'Motörhead');
             INSERT INTO songs_fts (rowid, ftstitle, ftsartist) VALUES (3, 'Back-in-Black', 'AC/DC');",
        )
        .unwrap();
        conn
    }

    fn matches(conn: &Connection, query: &str) -> Vec<i64> {
        let mut stmt = conn
            .prepare("SELECT rowid FROM songs_fts WHERE songs_fts MATCH ?1 ORDER BY rowid")
            .unwrap();
        stmt.query_map([query], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_cursor_hands_out_tokens_in_order() {
        let mut cursor = TokenCursor::open(&UnicodeTokenizer, "a-b".as_bytes());

        let (term, token, position) = cursor.next_token().unwrap();
        assert_eq!((term, token.start, token.end, position), (&b"a"[..], 0, 1, 0));
        let (term, token, position) = cursor.next_token().unwrap();
        assert_eq!((term, token.start, token.end, position), (&b"b"[..], 2, 3, 1));
        assert!(cursor.next_token().is_none());
    }

    #[test]
    fn test_registration_disabled_after_register() {
        let conn = fts_conn();
        let enabled = conn
            .db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FTS3_TOKENIZER)
            .unwrap();
        assert!(!enabled);

        // A pointer spelled out in SQL is refused once the flag is off
        let result = conn.query_row(
            "SELECT fts3_tokenizer('other', X'0000000000000000')",
            [],
            |_| Ok(()),
        );
        assert!(result.is_err());

        // Tables created afterwards still find the registered module
        conn.execute_batch("CREATE VIRTUAL TABLE later_fts USING fts3(body, tokenize=unicode)")
            .unwrap();
    }

    #[test]
    fn test_accent_insensitive_match() {
        let conn = fts_conn();
        assert_eq!(matches(&conn, "cafe"), vec![1]);
        assert_eq!(matches(&conn, "CAFÉ"), vec![1]);
        assert_eq!(matches(&conn, "motorhead"), vec![2]);
    }

    #[test]
    fn test_punctuation_separates_terms() {
        let conn = fts_conn();
        assert_eq!(matches(&conn, "black"), vec![3]);
        assert_eq!(matches(&conn, "dc"), vec![3]);
    }

    #[test]
    fn test_offsets_point_into_original_text() {
        let conn = fts_conn();
        let offsets: String = conn
            .query_row(
                "SELECT offsets(songs_fts) FROM songs_fts WHERE songs_fts MATCH 'cafe'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        // column 0, term 0, byte offset 0, byte length 5 ("Café" is 5 bytes)
        assert_eq!(offsets, "0 0 0 5");
    }

    #[test]
    fn test_snippet_highlights_original_bytes() {
        let conn = fts_conn();
        let snippet: String = conn
            .query_row(
                "SELECT snippet(songs_fts, '[', ']', '...') FROM songs_fts WHERE songs_fts MATCH 'motorhead'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(snippet, "[Motörhead]");
    }
}
