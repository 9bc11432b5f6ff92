//! Runtime binding to the DB2 Call Level Interface.
//!
//! The library is opened once per process and never unloaded. Handles created here are
//! only ever touched from the connection thread that created them.
#![allow(unsafe_code)]

use std::ffi::c_void;
use std::ptr;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use libloading::Library;

use crate::engine::RawRows;
use crate::error::DbQueueError;
use crate::types::{CellValue, IsolationLevel, TypedValue};

type SqlHandle = *mut c_void;
type SqlReturn = i16;

const SQL_HANDLE_ENV: i16 = 1;
const SQL_HANDLE_DBC: i16 = 2;
const SQL_HANDLE_STMT: i16 = 3;

const SQL_SUCCESS: SqlReturn = 0;
const SQL_SUCCESS_WITH_INFO: SqlReturn = 1;
const SQL_NO_DATA: SqlReturn = 100;

const SQL_NTS: i32 = -3;
const SQL_NULL_DATA: isize = -1;
const SQL_NO_TOTAL: isize = -4;
const SQL_DRIVER_NOPROMPT: u16 = 0;
const SQL_PARAM_INPUT: i16 = 1;
const SQL_COMMIT: i16 = 0;
const SQL_ROLLBACK: i16 = 1;

const SQL_ATTR_AUTOCOMMIT: i32 = 102;
const SQL_ATTR_TXN_ISOLATION: i32 = 108;

const SQL_C_CHAR: i16 = 1;
const SQL_C_BINARY: i16 = -2;

// Column types reported by SQLDescribeCol.
const SQL_NUMERIC: i16 = 2;
const SQL_DECIMAL: i16 = 3;
const SQL_INTEGER: i16 = 4;
const SQL_SMALLINT: i16 = 5;
const SQL_FLOAT: i16 = 6;
const SQL_REAL: i16 = 7;
const SQL_DOUBLE: i16 = 8;
const SQL_VARCHAR: i16 = 12;
const SQL_BOOLEAN: i16 = 16;
const SQL_TYPE_TIMESTAMP: i16 = 93;
const SQL_BIGINT: i16 = -5;
const SQL_BINARY: i16 = -2;
const SQL_VARBINARY: i16 = -3;
const SQL_LONGVARBINARY: i16 = -4;
const SQL_BLOB: i16 = -98;

const GET_DATA_CHUNK: usize = 4096;

#[cfg(target_os = "windows")]
const LIBRARY_NAMES: &[&str] = &["db2cli64.dll", "db2cli.dll"];
#[cfg(target_os = "macos")]
const LIBRARY_NAMES: &[&str] = &["libdb2.dylib"];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIBRARY_NAMES: &[&str] = &["libdb2.so", "libdb2.so.1"];

type AllocHandleFn = unsafe extern "C" fn(i16, SqlHandle, *mut SqlHandle) -> SqlReturn;
type FreeHandleFn = unsafe extern "C" fn(i16, SqlHandle) -> SqlReturn;
type DriverConnectFn = unsafe extern "C" fn(
    SqlHandle,
    *mut c_void,
    *const u8,
    i16,
    *mut u8,
    i16,
    *mut i16,
    u16,
) -> SqlReturn;
type DisconnectFn = unsafe extern "C" fn(SqlHandle) -> SqlReturn;
type ExecDirectFn = unsafe extern "C" fn(SqlHandle, *const u8, i32) -> SqlReturn;
type BindParameterFn = unsafe extern "C" fn(
    SqlHandle,
    u16,
    i16,
    i16,
    i16,
    usize,
    i16,
    *mut c_void,
    isize,
    *mut isize,
) -> SqlReturn;
type NumResultColsFn = unsafe extern "C" fn(SqlHandle, *mut i16) -> SqlReturn;
type DescribeColFn = unsafe extern "C" fn(
    SqlHandle,
    u16,
    *mut u8,
    i16,
    *mut i16,
    *mut i16,
    *mut usize,
    *mut i16,
    *mut i16,
) -> SqlReturn;
type FetchFn = unsafe extern "C" fn(SqlHandle) -> SqlReturn;
type GetDataFn =
    unsafe extern "C" fn(SqlHandle, u16, i16, *mut c_void, isize, *mut isize) -> SqlReturn;
type RowCountFn = unsafe extern "C" fn(SqlHandle, *mut isize) -> SqlReturn;
type EndTranFn = unsafe extern "C" fn(i16, SqlHandle, i16) -> SqlReturn;
type SetConnectAttrFn = unsafe extern "C" fn(SqlHandle, i32, *mut c_void, i32) -> SqlReturn;
type GetDiagRecFn = unsafe extern "C" fn(
    i16,
    SqlHandle,
    i16,
    *mut u8,
    *mut i32,
    *mut u8,
    i16,
    *mut i16,
) -> SqlReturn;

/// Function table resolved from the CLI library.
pub(super) struct Db2Api {
    _library: Library,
    alloc_handle: AllocHandleFn,
    free_handle: FreeHandleFn,
    driver_connect: DriverConnectFn,
    disconnect: DisconnectFn,
    exec_direct: ExecDirectFn,
    bind_parameter: BindParameterFn,
    num_result_cols: NumResultColsFn,
    describe_col: DescribeColFn,
    fetch: FetchFn,
    get_data: GetDataFn,
    row_count: RowCountFn,
    end_tran: EndTranFn,
    set_connect_attr: SetConnectAttrFn,
    get_diag_rec: GetDiagRecFn,
}

static API: OnceLock<Result<Db2Api, String>> = OnceLock::new();

/// Load the CLI library on first use.
///
/// # Errors
/// Returns [`DbQueueError::ConnectionError`] if no candidate library loads or a required
/// symbol is missing; the failure is cached for the life of the process.
pub(super) fn api(library: Option<&str>) -> Result<&'static Db2Api, DbQueueError> {
    API.get_or_init(|| load(library))
        .as_ref()
        .map_err(|e| DbQueueError::ConnectionError(e.clone()))
}

fn load(library: Option<&str>) -> Result<Db2Api, String> {
    let candidates: Vec<&str> = library.map_or_else(|| LIBRARY_NAMES.to_vec(), |l| vec![l]);
    let mut last_error = String::from("no candidates");
    for name in candidates {
        // SAFETY: opening the CLI library runs its initialisers, which have no preconditions.
        match unsafe { Library::new(name) } {
            Ok(lib) => return resolve(lib),
            Err(e) => last_error = format!("{name}: {e}"),
        }
    }
    Err(format!("failed to load DB2 CLI library ({last_error})"))
}

fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, String> {
    // SAFETY: every call site pairs the symbol name with its CLI prototype.
    unsafe { lib.get::<T>(name) }
        .map(|s| *s)
        .map_err(|e| format!("missing DB2 CLI symbol {}: {e}", String::from_utf8_lossy(name)))
}

fn resolve(lib: Library) -> Result<Db2Api, String> {
    Ok(Db2Api {
        alloc_handle: symbol(&lib, b"SQLAllocHandle\0")?,
        free_handle: symbol(&lib, b"SQLFreeHandle\0")?,
        driver_connect: symbol(&lib, b"SQLDriverConnect\0")?,
        disconnect: symbol(&lib, b"SQLDisconnect\0")?,
        exec_direct: symbol(&lib, b"SQLExecDirect\0")?,
        bind_parameter: symbol(&lib, b"SQLBindParameter\0")?,
        num_result_cols: symbol(&lib, b"SQLNumResultCols\0")?,
        describe_col: symbol(&lib, b"SQLDescribeCol\0")?,
        fetch: symbol(&lib, b"SQLFetch\0")?,
        get_data: symbol(&lib, b"SQLGetData\0")?,
        row_count: symbol(&lib, b"SQLRowCount\0")?,
        end_tran: symbol(&lib, b"SQLEndTran\0")?,
        set_connect_attr: symbol(&lib, b"SQLSetConnectAttr\0")?,
        get_diag_rec: symbol(&lib, b"SQLGetDiagRec\0")?,
        _library: lib,
    })
}

fn succeeded(rc: SqlReturn) -> bool {
    rc == SQL_SUCCESS || rc == SQL_SUCCESS_WITH_INFO
}

/// An environment plus connection handle pair.
pub(super) struct CliConnection {
    api: &'static Db2Api,
    env: SqlHandle,
    dbc: SqlHandle,
    connected: bool,
}

impl CliConnection {
    /// # Errors
    /// Returns [`DbQueueError::ConnectionError`] with the CLI diagnostic on failure.
    pub(super) fn connect(api: &'static Db2Api, conn_str: &str) -> Result<Self, DbQueueError> {
        let mut conn = Self {
            api,
            env: ptr::null_mut(),
            dbc: ptr::null_mut(),
            connected: false,
        };
        // SAFETY: output pointers are valid locals; a null input handle is required for ENV.
        let rc = unsafe { (api.alloc_handle)(SQL_HANDLE_ENV, ptr::null_mut(), &raw mut conn.env) };
        if !succeeded(rc) {
            return Err(DbQueueError::ConnectionError(
                "DB2 environment handle allocation failed".into(),
            ));
        }
        // SAFETY: env was allocated above.
        let rc = unsafe { (api.alloc_handle)(SQL_HANDLE_DBC, conn.env, &raw mut conn.dbc) };
        if !succeeded(rc) {
            return Err(DbQueueError::ConnectionError(conn.diag(SQL_HANDLE_ENV, conn.env)));
        }

        let len = i16::try_from(conn_str.len()).map_err(|_| {
            DbQueueError::ConnectionError("DB2 connection string too long".into())
        })?;
        let mut out_len: i16 = 0;
        // SAFETY: the input buffer outlives the call and its length is passed explicitly;
        // no output buffer is requested.
        let rc = unsafe {
            (api.driver_connect)(
                conn.dbc,
                ptr::null_mut(),
                conn_str.as_ptr(),
                len,
                ptr::null_mut(),
                0,
                &raw mut out_len,
                SQL_DRIVER_NOPROMPT,
            )
        };
        if !succeeded(rc) {
            return Err(DbQueueError::ConnectionError(conn.diag(SQL_HANDLE_DBC, conn.dbc)));
        }
        conn.connected = true;
        Ok(conn)
    }

    fn diag(&self, handle_type: i16, handle: SqlHandle) -> String {
        let mut state = [0u8; 6];
        let mut native: i32 = 0;
        let mut message = [0u8; 1024];
        let mut message_len: i16 = 0;
        // SAFETY: all buffers are local and sized as passed.
        let rc = unsafe {
            (self.api.get_diag_rec)(
                handle_type,
                handle,
                1,
                state.as_mut_ptr(),
                &raw mut native,
                message.as_mut_ptr(),
                1024,
                &raw mut message_len,
            )
        };
        if !succeeded(rc) {
            return "DB2 CLI call failed (no diagnostics)".to_string();
        }
        let text_len = usize::try_from(message_len).unwrap_or(0).min(message.len());
        format!(
            "SQLSTATE {} ({native}): {}",
            String::from_utf8_lossy(&state[..5]),
            String::from_utf8_lossy(&message[..text_len]).trim_end()
        )
    }

    fn check(&self, rc: SqlReturn, handle_type: i16, handle: SqlHandle) -> Result<(), DbQueueError> {
        if succeeded(rc) {
            Ok(())
        } else {
            Err(DbQueueError::QueryError(self.diag(handle_type, handle)))
        }
    }

    fn set_attr(&self, attr: i32, value: usize) -> Result<(), DbQueueError> {
        // SAFETY: integer attributes are passed by value in the pointer slot.
        let rc = unsafe { (self.api.set_connect_attr)(self.dbc, attr, value as *mut c_void, 0) };
        self.check(rc, SQL_HANDLE_DBC, self.dbc)
    }

    pub(super) fn set_autocommit(&self, on: bool) -> Result<(), DbQueueError> {
        self.set_attr(SQL_ATTR_AUTOCOMMIT, usize::from(on))
    }

    pub(super) fn set_isolation(&self, isolation: IsolationLevel) -> Result<(), DbQueueError> {
        let level = match isolation {
            IsolationLevel::ReadUncommitted => 1,
            IsolationLevel::ReadCommitted => 2,
            IsolationLevel::RepeatableRead => 4,
            IsolationLevel::Serializable => 8,
        };
        self.set_attr(SQL_ATTR_TXN_ISOLATION, level)
    }

    pub(super) fn end_transaction(&self, commit: bool) -> Result<(), DbQueueError> {
        let completion = if commit { SQL_COMMIT } else { SQL_ROLLBACK };
        // SAFETY: dbc is a live connection handle.
        let rc = unsafe { (self.api.end_tran)(SQL_HANDLE_DBC, self.dbc, completion) };
        self.check(rc, SQL_HANDLE_DBC, self.dbc)
    }

    /// Run one statement, binding every parameter as character data.
    pub(super) fn execute(&self, sql: &str, params: &[TypedValue]) -> Result<RawRows, DbQueueError> {
        let stmt = Statement::alloc(self)?;

        // Buffers must stay alive until SQLExecDirect returns.
        let mut buffers: Vec<Vec<u8>> = params.iter().map(|p| p.to_text().into_bytes()).collect();
        let mut indicators: Vec<isize> = buffers
            .iter()
            .map(|b| isize::try_from(b.len()).unwrap_or(isize::MAX))
            .collect();
        for (i, (buffer, indicator)) in buffers.iter_mut().zip(indicators.iter_mut()).enumerate() {
            let position = u16::try_from(i + 1)
                .map_err(|_| DbQueueError::ParameterError("too many DB2 parameters".into()))?;
            let len = *indicator;
            // SAFETY: buffer and indicator outlive the execute below and are not moved.
            let rc = unsafe {
                (self.api.bind_parameter)(
                    stmt.handle,
                    position,
                    SQL_PARAM_INPUT,
                    SQL_C_CHAR,
                    SQL_VARCHAR,
                    buffer.len().max(1),
                    0,
                    buffer.as_mut_ptr().cast(),
                    len,
                    indicator,
                )
            };
            stmt.check(rc)?;
        }

        let sql_len = i32::try_from(sql.len()).unwrap_or(SQL_NTS);
        // SAFETY: sql outlives the call; bound buffers are alive.
        let rc = unsafe { (self.api.exec_direct)(stmt.handle, sql.as_ptr(), sql_len) };
        if rc != SQL_NO_DATA {
            stmt.check(rc)?;
        }
        drop(buffers);

        let mut col_count: i16 = 0;
        // SAFETY: out pointer is a valid local.
        stmt.check(unsafe { (self.api.num_result_cols)(stmt.handle, &raw mut col_count) })?;
        if col_count <= 0 {
            let mut affected: isize = 0;
            // SAFETY: out pointer is a valid local.
            stmt.check(unsafe { (self.api.row_count)(stmt.handle, &raw mut affected) })?;
            return Ok(RawRows {
                affected: u64::try_from(affected).unwrap_or(0),
                ..RawRows::default()
            });
        }

        let mut columns = Vec::new();
        let mut types = Vec::new();
        for col in 1..=u16::try_from(col_count).unwrap_or(0) {
            let (name, sql_type) = stmt.describe(col)?;
            columns.push(name);
            types.push(sql_type);
        }

        let mut rows = Vec::new();
        loop {
            // SAFETY: stmt holds an executed result set.
            let rc = unsafe { (self.api.fetch)(stmt.handle) };
            if rc == SQL_NO_DATA {
                break;
            }
            stmt.check(rc)?;
            let mut row = Vec::with_capacity(columns.len());
            for (idx, sql_type) in types.iter().enumerate() {
                let col = u16::try_from(idx + 1).unwrap_or(u16::MAX);
                row.push(stmt.cell(col, *sql_type)?);
            }
            rows.push(row);
        }
        Ok(RawRows {
            columns,
            rows,
            affected: 0,
        })
    }
}

impl Drop for CliConnection {
    fn drop(&mut self) {
        // SAFETY: handles are either null or were allocated by this struct and are freed once.
        unsafe {
            if self.connected {
                (self.api.disconnect)(self.dbc);
            }
            if !self.dbc.is_null() {
                (self.api.free_handle)(SQL_HANDLE_DBC, self.dbc);
            }
            if !self.env.is_null() {
                (self.api.free_handle)(SQL_HANDLE_ENV, self.env);
            }
        }
    }
}

struct Statement<'c> {
    conn: &'c CliConnection,
    handle: SqlHandle,
}

impl<'c> Statement<'c> {
    fn alloc(conn: &'c CliConnection) -> Result<Self, DbQueueError> {
        let mut handle: SqlHandle = ptr::null_mut();
        // SAFETY: dbc is live; handle is a valid out pointer.
        let rc = unsafe { (conn.api.alloc_handle)(SQL_HANDLE_STMT, conn.dbc, &raw mut handle) };
        conn.check(rc, SQL_HANDLE_DBC, conn.dbc)?;
        Ok(Self { conn, handle })
    }

    fn check(&self, rc: SqlReturn) -> Result<(), DbQueueError> {
        self.conn.check(rc, SQL_HANDLE_STMT, self.handle)
    }

    fn describe(&self, col: u16) -> Result<(String, i16), DbQueueError> {
        let mut name = [0u8; 256];
        let mut name_len: i16 = 0;
        let mut sql_type: i16 = 0;
        let mut size: usize = 0;
        let mut digits: i16 = 0;
        let mut nullable: i16 = 0;
        // SAFETY: all out pointers are valid locals; name buffer length is passed.
        let rc = unsafe {
            (self.conn.api.describe_col)(
                self.handle,
                col,
                name.as_mut_ptr(),
                256,
                &raw mut name_len,
                &raw mut sql_type,
                &raw mut size,
                &raw mut digits,
                &raw mut nullable,
            )
        };
        self.check(rc)?;
        let len = usize::try_from(name_len).unwrap_or(0).min(name.len());
        Ok((String::from_utf8_lossy(&name[..len]).into_owned(), sql_type))
    }

    /// Read a whole column value, looping over `SQLGetData` chunks.
    fn read(&self, col: u16, c_type: i16) -> Result<Option<Vec<u8>>, DbQueueError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; GET_DATA_CHUNK];
        // Character data is NUL-terminated inside each chunk.
        let usable = if c_type == SQL_C_CHAR {
            GET_DATA_CHUNK - 1
        } else {
            GET_DATA_CHUNK
        };
        loop {
            let mut indicator: isize = 0;
            // SAFETY: chunk is a local buffer of the length passed.
            let rc = unsafe {
                (self.conn.api.get_data)(
                    self.handle,
                    col,
                    c_type,
                    chunk.as_mut_ptr().cast(),
                    isize::try_from(GET_DATA_CHUNK).unwrap_or(isize::MAX),
                    &raw mut indicator,
                )
            };
            if rc == SQL_NO_DATA {
                break;
            }
            self.check(rc)?;
            if indicator == SQL_NULL_DATA {
                return Ok(None);
            }
            let available = if indicator == SQL_NO_TOTAL {
                usable
            } else {
                usize::try_from(indicator).unwrap_or(0)
            };
            out.extend_from_slice(&chunk[..available.min(usable)]);
            if rc == SQL_SUCCESS {
                break;
            }
        }
        Ok(Some(out))
    }

    fn cell(&self, col: u16, sql_type: i16) -> Result<CellValue, DbQueueError> {
        if matches!(
            sql_type,
            SQL_BINARY | SQL_VARBINARY | SQL_LONGVARBINARY | SQL_BLOB
        ) {
            return Ok(self
                .read(col, SQL_C_BINARY)?
                .map_or(CellValue::Null, CellValue::Blob));
        }
        let Some(bytes) = self.read(col, SQL_C_CHAR)? else {
            return Ok(CellValue::Null);
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(db2_text_to_cell(sql_type, text))
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        // SAFETY: handle was allocated in `alloc` and is freed exactly once.
        unsafe {
            (self.conn.api.free_handle)(SQL_HANDLE_STMT, self.handle);
        }
    }
}

/// Type a character-mode column value by its described SQL type.
pub(super) fn db2_text_to_cell(sql_type: i16, text: String) -> CellValue {
    match sql_type {
        SQL_SMALLINT | SQL_INTEGER | SQL_BIGINT => text
            .trim()
            .parse()
            .map_or(CellValue::Text(text), CellValue::Int),
        SQL_REAL | SQL_FLOAT | SQL_DOUBLE => text
            .trim()
            .parse()
            .map_or(CellValue::Text(text), CellValue::Float),
        SQL_BOOLEAN => match text.trim() {
            "1" | "true" | "TRUE" => CellValue::Bool(true),
            "0" | "false" | "FALSE" => CellValue::Bool(false),
            _ => CellValue::Text(text),
        },
        SQL_TYPE_TIMESTAMP => NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d-%H.%M.%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S%.f"))
            .map_or(CellValue::Text(text), CellValue::Timestamp),
        // Decimal text is emitted as a JSON number by the row writer.
        SQL_DECIMAL | SQL_NUMERIC => CellValue::Text(text.trim().to_string()),
        _ => CellValue::Text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_character_data() {
        assert_eq!(db2_text_to_cell(SQL_INTEGER, " 42".into()), CellValue::Int(42));
        assert_eq!(db2_text_to_cell(SQL_DOUBLE, "1.5".into()), CellValue::Float(1.5));
        assert_eq!(db2_text_to_cell(SQL_BOOLEAN, "1".into()), CellValue::Bool(true));
        assert_eq!(
            db2_text_to_cell(SQL_DECIMAL, "  12.50".into()),
            CellValue::Text("12.50".into())
        );
        let CellValue::Timestamp(ts) =
            db2_text_to_cell(SQL_TYPE_TIMESTAMP, "2024-01-02-03.04.05.000000".into())
        else {
            panic!("expected timestamp");
        };
        assert_eq!(ts.to_string(), "2024-01-02 03:04:05");
        assert_eq!(
            db2_text_to_cell(SQL_INTEGER, "abc".into()),
            CellValue::Text("abc".into())
        );
    }

    #[test]
    fn missing_library_is_a_connection_error() {
        let err = load(Some("/nonexistent/libdb2-missing.so")).err().expect("load fails");
        assert!(err.contains("failed to load DB2 CLI library"));
    }
}
