//! Row decoding and value encoding helpers shared by the storage modules.

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, Rows};
use serde::Serialize;
use serde::de::DeserializeOwned;

use librarian_shared::{LibrarianError, Result};

pub(crate) fn db_err(e: libsql::Error) -> LibrarianError {
    LibrarianError::Storage(e.to_string())
}

/// Fixed-precision RFC 3339 so stored timestamps compare lexicographically.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn opt_ts(dt: Option<&DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LibrarianError::Storage(format!("invalid date '{s}': {e}")))
}

pub(crate) fn col_string(row: &Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

/// NULL (or a type mismatch) reads as `None`.
pub(crate) fn col_opt_string(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

pub(crate) fn col_i64(row: &Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(db_err)
}

pub(crate) fn col_opt_i64(row: &Row, idx: i32) -> Option<i64> {
    row.get::<i64>(idx).ok()
}

pub(crate) fn col_opt_f64(row: &Row, idx: i32) -> Option<f64> {
    row.get::<f64>(idx).ok()
}

pub(crate) fn col_bool(row: &Row, idx: i32) -> bool {
    row.get::<i64>(idx).map(|v| v != 0).unwrap_or(false)
}

pub(crate) fn col_opt_bool(row: &Row, idx: i32) -> Option<bool> {
    row.get::<i64>(idx).ok().map(|v| v != 0)
}

pub(crate) fn col_ts(row: &Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_ts(&col_string(row, idx)?)
}

pub(crate) fn col_opt_ts(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    col_opt_string(row, idx).map(|s| parse_ts(&s)).transpose()
}

pub(crate) fn col_parse<T>(row: &Row, idx: i32) -> Result<T>
where
    T: std::str::FromStr<Err = LibrarianError>,
{
    col_string(row, idx)?.parse()
}

pub(crate) fn col_json<T: DeserializeOwned>(row: &Row, idx: i32) -> Result<T> {
    let raw = col_string(row, idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| LibrarianError::Storage(format!("invalid JSON in column {idx}: {e}")))
}

pub(crate) fn col_opt_json<T: DeserializeOwned>(row: &Row, idx: i32) -> Result<Option<T>> {
    match col_opt_string(row, idx) {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| LibrarianError::Storage(format!("invalid JSON in column {idx}: {e}"))),
        None => Ok(None),
    }
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| LibrarianError::Storage(e.to_string()))
}

/// Drain a result set through a row mapper.
pub(crate) async fn collect<T>(mut rows: Rows, map: impl Fn(&Row) -> Result<T>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        out.push(map(&row)?);
    }
    Ok(out)
}

/// First row of a result set, if any.
pub(crate) async fn first<T>(mut rows: Rows, map: impl Fn(&Row) -> Result<T>) -> Result<Option<T>> {
    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(map(&row)?)),
        None => Ok(None),
    }
}

/// Read a single `COUNT(*)`-style integer.
pub(crate) async fn scalar_u64(rows: Rows) -> Result<u64> {
    Ok(first(rows, |row| col_i64(row, 0)).await?.unwrap_or(0).max(0) as u64)
}

/// Encode an embedding as little-endian f32 bytes.
pub(crate) fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub(crate) fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_sort_as_text() {
        let a = DateTime::parse_from_rfc3339("2026-01-01T10:00:05Z")
            .expect("parse")
            .with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2026-01-01T10:00:05.5Z")
            .expect("parse")
            .with_timezone(&Utc);
        assert!(ts(&a) < ts(&b));
        assert_eq!(parse_ts(&ts(&b)).expect("roundtrip"), b);
    }

    #[test]
    fn embedding_blob_encoding() {
        let v = vec![1.0f32, -2.5, 3.125];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_vec(&blob), v);
    }
}
