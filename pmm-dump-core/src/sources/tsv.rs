//! Tab-separated row codec for the columnar store.
//!
//! Field values use ClickHouse TSV escaping, so a raw tab only ever separates
//! fields and a raw newline only ever separates rows. Import re-types every
//! field against the column metadata before insertion.

use crate::error::{DumpError, Result};

/// One column of the remote table.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self { name: name.into(), type_name: type_name.into() }
    }

    fn class(&self) -> ColumnClass {
        // Unwrap Nullable(...) / LowCardinality(...) wrappers.
        let mut base = self.type_name.as_str();
        loop {
            if let Some(inner) =
                base.strip_prefix("Nullable(").and_then(|s| s.strip_suffix(')'))
            {
                base = inner;
            } else if let Some(inner) =
                base.strip_prefix("LowCardinality(").and_then(|s| s.strip_suffix(')'))
            {
                base = inner;
            } else {
                break;
            }
        }

        match base {
            "Int8" | "Int16" | "Int32" | "Int64" => ColumnClass::Int,
            "UInt8" | "UInt16" | "UInt32" | "UInt64" => ColumnClass::UInt,
            "Float32" | "Float64" => ColumnClass::Float,
            _ => ColumnClass::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnClass {
    Int,
    UInt,
    Float,
    /// Strings, dates, arrays: passed through as text.
    Other,
}

/// TSV escape one field value.
pub fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            _ => out.push(c),
        }
    }
    out
}

/// Undo [`escape`].
pub fn unescape(field: &str) -> Result<String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\'') => out.push('\''),
            Some('N') => out.push_str("\\N"), // null marker kept verbatim
            other => {
                return Err(DumpError::Format {
                    reason: format!("invalid TSV escape \\{}", other.unwrap_or(' ')),
                })
            }
        }
    }
    Ok(out)
}

/// Split one TSV line into unescaped field values.
pub fn parse_line(line: &str) -> Result<Vec<String>> {
    line.split('\t').map(unescape).collect()
}

/// Encode field values back into one TSV line. The `\N` null sentinel is
/// emitted verbatim, not re-escaped.
pub fn encode_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| if f == "\\N" { f.clone() } else { escape(f) })
        .collect::<Vec<_>>()
        .join("\t")
}

/// Validate one parsed row against the column metadata.
///
/// Field count must match and numeric columns must parse; everything else is
/// passed through as text. `\N` is accepted anywhere (the store rejects it on
/// non-nullable columns itself).
pub fn retype_row(fields: &[String], columns: &[Column]) -> Result<()> {
    if fields.len() != columns.len() {
        return Err(DumpError::Format {
            reason: format!(
                "row has {} fields, table has {} columns",
                fields.len(),
                columns.len()
            ),
        });
    }

    for (field, column) in fields.iter().zip(columns) {
        if field == "\\N" {
            continue;
        }
        let ok = match column.class() {
            ColumnClass::Int => field.parse::<i64>().is_ok(),
            ColumnClass::UInt => field.parse::<u64>().is_ok(),
            ColumnClass::Float => field.parse::<f64>().is_ok(),
            ColumnClass::Other => true,
        };
        if !ok {
            return Err(DumpError::Format {
                reason: format!(
                    "column {} ({}) cannot hold value {:?}",
                    column.name, column.type_name, field
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        for raw in ["plain", "tab\there", "line\nbreak", "back\\slash", "mixed\t\n\\\r"] {
            let escaped = escape(raw);
            assert!(!escaped.contains('\t') && !escaped.contains('\n'));
            assert_eq!(unescape(&escaped).unwrap(), raw);
        }
    }

    #[test]
    fn test_parse_and_encode_line() {
        let fields = parse_line("a\tb\\tc\t1.5").unwrap();
        assert_eq!(fields, vec!["a", "b\tc", "1.5"]);
        assert_eq!(encode_line(&fields), "a\tb\\tc\t1.5");
    }

    #[test]
    fn test_invalid_escape_rejected() {
        assert!(unescape("bad\\x").is_err());
    }

    #[test]
    fn test_retype_accepts_matching_row() {
        let columns = vec![
            Column::new("queryid", "String"),
            Column::new("num_queries", "UInt64"),
            Column::new("m_query_time_sum", "Nullable(Float32)"),
        ];
        let fields = vec!["abc".to_string(), "42".to_string(), "0.25".to_string()];
        assert!(retype_row(&fields, &columns).is_ok());

        let with_null = vec!["abc".to_string(), "42".to_string(), "\\N".to_string()];
        assert!(retype_row(&with_null, &columns).is_ok());
    }

    #[test]
    fn test_retype_rejects_mismatches() {
        let columns = vec![Column::new("n", "UInt64")];
        assert!(retype_row(&["-1".to_string()], &columns).is_err());
        assert!(retype_row(&["abc".to_string()], &columns).is_err());
        assert!(retype_row(&["1".to_string(), "2".to_string()], &columns).is_err());
    }

    #[test]
    fn test_wrapped_types_classify() {
        let col = Column::new("x", "LowCardinality(Nullable(Int32))");
        assert!(retype_row(&["-7".to_string()], std::slice::from_ref(&col)).is_ok());
        assert!(retype_row(&["x".to_string()], std::slice::from_ref(&col)).is_err());
    }
}
