//! Schema enumeration and DDL printing.
//!
//! One `SHOW TABLES` pass discovers the tables of the connected database,
//! then one `SHOW CREATE TABLE` per table fetches its DDL. Blocks are written
//! to the output sink in server order, each terminated by a `;` line and a
//! fixed 40-dash delimiter.

use std::io::Write;

use serde::Deserialize;

use crate::client::{Session, quote_identifier};
use crate::error::{ChdumpError, Result};

/// Delimiter line printed after each DDL block.
pub const BLOCK_DELIMITER: &str = "----------------------------------------";

/// One row of `SHOW TABLES` output.
#[derive(Debug, Deserialize)]
struct TableRow {
    name: String,
}

/// One row of `SHOW CREATE TABLE` output.
#[derive(Debug, Deserialize)]
struct CreateTableRow {
    statement: String,
}

/// Dumps the creation statement of every table in the connected database.
///
/// Tables are processed strictly sequentially, in the order the server
/// returns them; the enumeration cursor stays open while per-table queries
/// run.
///
/// # Errors
/// Fails on the first enumeration, DDL fetch, row decode, or write failure.
/// Nothing is retried and no further tables are processed after an error.
pub async fn dump_schema<W: Write>(session: &Session, out: &mut W) -> Result<()> {
    let mut tables = session
        .query::<TableRow>("SHOW TABLES", "table listing")
        .await?;

    let mut dumped = 0usize;
    while let Some(table) = tables.next_row().await? {
        tracing::debug!("dumping table {}", table.name);
        dump_table(session, &table.name, out).await?;
        dumped += 1;
    }

    tracing::info!("dumped {} table definitions", dumped);
    Ok(())
}

/// Fetches and prints the DDL block for one table.
///
/// Only the first result row is read; any further rows are abandoned with
/// the cursor. A zero-row result prints nothing and is not an error.
async fn dump_table<W: Write>(session: &Session, name: &str, out: &mut W) -> Result<()> {
    let sql = format!("SHOW CREATE TABLE {}", quote_identifier(name));
    let context = format!("DDL for table {name}");
    let mut rows = session.query::<CreateTableRow>(&sql, &context).await?;

    let first = rows.next_row().await?;
    write_first_ddl(out, first, name)
}

/// Writes the DDL block for the first result row, if there is one.
///
/// A zero-row result prints nothing and is not an error; it is only
/// surfaced as a warning.
fn write_first_ddl<W: Write>(out: &mut W, row: Option<CreateTableRow>, name: &str) -> Result<()> {
    match row {
        Some(row) => write_ddl_block(out, &row.statement),
        None => {
            tracing::warn!("server returned no DDL for table {}", name);
            Ok(())
        }
    }
}

/// Writes one DDL block: the statement, a `;` line, and the delimiter line.
///
/// # Errors
/// Returns `ChdumpError::Io` when the sink rejects the write.
pub fn write_ddl_block<W: Write>(out: &mut W, ddl: &str) -> Result<()> {
    writeln!(out, "{ddl}\n;\n{BLOCK_DELIMITER}").map_err(|e| ChdumpError::Io {
        context: "writing DDL block".to_string(),
        source: e,
    })
}
