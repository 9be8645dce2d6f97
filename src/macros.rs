/// Build an INSERT statement plus its bound arguments.
///
/// ## Example
/// ```ignore
/// let (sql, args) = build_insert_sql!(
///     "tags",
///     [
///         ("name", "vacation"),
///         ("source", 0_i64)
///     ]
/// );
/// ```
#[macro_export]
macro_rules! build_insert_sql {
    ($table: expr, [$(($field: expr, $value: expr)), *]) => {
        {
            use sqlx::Arguments;
            let fields: &[&str] = &[$($field),*];
            let len = fields.len();
            let sql = {
                let fields = fields.join(", ");
                let placeholders = "?, ".repeat(len).trim_end_matches(", ").to_string();
                format!("INSERT INTO {} ({}) VALUES ({})", $table, fields, placeholders)
            };
            let mut args = sqlx::sqlite::SqliteArguments::default();
            $(args.add($value).map_err(|e| anyhow::format_err!("Failed to add '{}' value to args, reason: {}", $field, e))?;)*
            (sql, args)
        }
    };
}
