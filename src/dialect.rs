use crate::schema::{
    ColumnType, EntitySchema, IndexDef, IndexKind, PropertyDef, CREATED_AT_COLUMN, ID_COLUMN,
    UPDATED_AT_COLUMN,
};
use serde_json::{json, Value};
use std::fmt;

/// SQL dialect spoken by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// Underlying storage family of a column type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeFamily {
    Integer,
    Float,
    Boolean,
    Text,
    Timestamp,
    Date,
    Time,
    Json,
    /// A column type this crate never declares
    Other(String),
}

/// Column type as the differ sees it: family plus limits.
///
/// `None` limits mean unbounded, so going from `Some` to `None` widens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlType {
    pub family: TypeFamily,
    pub length: Option<u32>,
    pub decimals: Option<u32>,
}

impl SqlType {
    pub fn new(family: TypeFamily) -> Self {
        Self {
            family,
            length: None,
            decimals: None,
        }
    }

    /// Storage type of a declared property
    pub fn of(property: &PropertyDef) -> Self {
        let family = match &property.column_type {
            ColumnType::Integer | ColumnType::Reference(_) => TypeFamily::Integer,
            ColumnType::Float => TypeFamily::Float,
            ColumnType::Boolean => TypeFamily::Boolean,
            ColumnType::Text => TypeFamily::Text,
            ColumnType::Timestamp => TypeFamily::Timestamp,
            ColumnType::Date => TypeFamily::Date,
            ColumnType::Time => TypeFamily::Time,
            ColumnType::Json => TypeFamily::Json,
        };
        let (length, decimals) = match family {
            TypeFamily::Float => (property.length, property.decimals),
            TypeFamily::Text => (property.length, None),
            _ => (None, None),
        };
        Self {
            family,
            length,
            decimals,
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.family)?;
        match (self.length, self.decimals) {
            (Some(l), Some(d)) => write!(f, "({},{})", l, d),
            (Some(l), None) => write!(f, "({})", l),
            _ => Ok(()),
        }
    }
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
        }
    }

    pub fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Rewrite `?` placeholders into the dialect's positional form.
    ///
    /// Placeholders inside string literals and quoted identifiers are left alone.
    pub fn finalize_placeholders(&self, sql: &str) -> String {
        if *self == Dialect::Sqlite {
            return sql.to_string();
        }

        let mut out = String::with_capacity(sql.len() + 8);
        let mut index = 0;
        let mut quote: Option<char> = None;
        for c in sql.chars() {
            match quote {
                Some(q) => {
                    if c == q {
                        quote = None;
                    }
                    out.push(c);
                }
                None => match c {
                    '\'' | '"' => {
                        quote = Some(c);
                        out.push(c);
                    }
                    '?' => {
                        index += 1;
                        out.push('$');
                        out.push_str(&index.to_string());
                    }
                    _ => out.push(c),
                },
            }
        }
        out
    }

    pub fn render_type(&self, sql_type: &SqlType) -> String {
        match (&sql_type.family, self) {
            (TypeFamily::Integer, Dialect::Sqlite) => "INTEGER".to_string(),
            (TypeFamily::Integer, Dialect::Postgres) => "BIGINT".to_string(),
            (TypeFamily::Float, _) => match (sql_type.length, sql_type.decimals, self) {
                (Some(p), s, Dialect::Sqlite) => format!("DECIMAL({},{})", p, s.unwrap_or(0)),
                (Some(p), s, Dialect::Postgres) => format!("NUMERIC({},{})", p, s.unwrap_or(0)),
                (None, _, Dialect::Sqlite) => "REAL".to_string(),
                (None, _, Dialect::Postgres) => "DOUBLE PRECISION".to_string(),
            },
            (TypeFamily::Boolean, _) => "BOOLEAN".to_string(),
            (TypeFamily::Text, _) => match sql_type.length {
                Some(n) => format!("VARCHAR({})", n),
                None => "TEXT".to_string(),
            },
            (TypeFamily::Timestamp, Dialect::Sqlite) => "DATETIME".to_string(),
            (TypeFamily::Timestamp, Dialect::Postgres) => "TIMESTAMP".to_string(),
            (TypeFamily::Date, _) => "DATE".to_string(),
            (TypeFamily::Time, _) => "TIME".to_string(),
            (TypeFamily::Json, Dialect::Sqlite) => "JSON_TEXT".to_string(),
            (TypeFamily::Json, Dialect::Postgres) => "JSONB".to_string(),
            (TypeFamily::Other(raw), _) => raw.clone(),
        }
    }

    /// Parse a column type as reported by the database catalog
    pub fn parse_type(&self, raw: &str) -> SqlType {
        let upper = raw.trim().to_ascii_uppercase();
        let (base, args) = match upper.find('(') {
            Some(open) => {
                let close = upper.rfind(')').unwrap_or(upper.len());
                let args: Vec<u32> = upper[open + 1..close.max(open + 1)]
                    .split(',')
                    .filter_map(|a| a.trim().parse().ok())
                    .collect();
                (upper[..open].trim().to_string(), args)
            }
            None => (upper.clone(), Vec::new()),
        };

        let family = match base.as_str() {
            "INTEGER" | "INT" | "INT2" | "INT4" | "INT8" | "BIGINT" | "SMALLINT" | "TINYINT"
            | "MEDIUMINT" | "SERIAL" | "BIGSERIAL" => TypeFamily::Integer,
            "REAL" | "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" | "DECIMAL"
            | "NUMERIC" => TypeFamily::Float,
            "BOOLEAN" | "BOOL" => TypeFamily::Boolean,
            "TEXT" | "VARCHAR" | "CHARACTER VARYING" | "CLOB" => TypeFamily::Text,
            "DATETIME" | "TIMESTAMP" | "TIMESTAMP WITHOUT TIME ZONE" => TypeFamily::Timestamp,
            "DATE" => TypeFamily::Date,
            "TIME" | "TIME WITHOUT TIME ZONE" => TypeFamily::Time,
            "JSON" | "JSONB" | "JSON_TEXT" => TypeFamily::Json,
            _ => TypeFamily::Other(upper.clone()),
        };

        let (length, decimals) = match family {
            TypeFamily::Float if base == "DECIMAL" || base == "NUMERIC" => {
                match args.as_slice() {
                    [p, s] => (Some(*p), Some(*s)),
                    [p] => (Some(*p), Some(0)),
                    _ => (None, None),
                }
            }
            TypeFamily::Text => (args.first().copied(), None),
            _ => (None, None),
        };

        SqlType {
            family,
            length,
            decimals,
        }
    }

    pub fn primary_key_column(&self) -> String {
        match self {
            Dialect::Sqlite => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", self.quote_ident(ID_COLUMN)),
            Dialect::Postgres => format!("{} BIGSERIAL PRIMARY KEY", self.quote_ident(ID_COLUMN)),
        }
    }

    fn timestamp_column(&self, name: &str) -> String {
        format!(
            "{} {}",
            self.quote_ident(name),
            self.render_type(&SqlType::new(TypeFamily::Timestamp))
        )
    }

    /// Full column definition used by CREATE TABLE
    pub fn column_definition(&self, property: &PropertyDef) -> String {
        let mut def = format!(
            "{} {}",
            self.quote_ident(&property.name),
            self.render_type(&SqlType::of(property))
        );
        if !property.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &property.default {
            def.push_str(" DEFAULT ");
            def.push_str(&self.render_default(property, default));
        }
        def
    }

    /// Column definition for ADD COLUMN on a possibly populated table.
    ///
    /// A NOT NULL column without a declared default gets its type's zero value.
    pub fn add_column_definition(&self, property: &PropertyDef) -> String {
        if property.nullable || property.default.is_some() {
            return self.column_definition(property);
        }
        let zero = zero_value(&SqlType::of(property).family);
        format!(
            "{} {} NOT NULL DEFAULT {}",
            self.quote_ident(&property.name),
            self.render_type(&SqlType::of(property)),
            self.render_default(property, &zero)
        )
    }

    /// SQL literal for a default value
    pub fn render_default(&self, property: &PropertyDef, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => match (self, b) {
                (Dialect::Sqlite, true) => "1".to_string(),
                (Dialect::Sqlite, false) => "0".to_string(),
                (Dialect::Postgres, true) => "TRUE".to_string(),
                (Dialect::Postgres, false) => "FALSE".to_string(),
            },
            Value::Number(n) if property.column_type != ColumnType::Json => n.to_string(),
            Value::String(s) if property.column_type != ColumnType::Json => quote_literal(s),
            other => quote_literal(&other.to_string()),
        }
    }

    /// Bind expression for a parameter written into a column
    pub fn param_expr(&self, sql_type: &SqlType) -> &'static str {
        match self {
            Dialect::Sqlite => "?",
            Dialect::Postgres => match &sql_type.family {
                TypeFamily::Integer => "?::BIGINT",
                TypeFamily::Float if sql_type.length.is_some() => "?::NUMERIC",
                TypeFamily::Float => "?::DOUBLE PRECISION",
                TypeFamily::Boolean => "?::BOOLEAN",
                TypeFamily::Timestamp => "?::TIMESTAMP",
                TypeFamily::Date => "?::DATE",
                TypeFamily::Time => "?::TIME",
                TypeFamily::Json => "?::JSONB",
                TypeFamily::Text | TypeFamily::Other(_) => "?",
            },
        }
    }

    /// Select-list expression that reads a column in a driver-decodable form
    pub fn select_expr(&self, column: &str, sql_type: &SqlType) -> String {
        let quoted = self.quote_ident(column);
        match self {
            Dialect::Sqlite => quoted,
            Dialect::Postgres => match &sql_type.family {
                TypeFamily::Float => format!("{}::float8 AS {}", quoted, quoted),
                TypeFamily::Timestamp
                | TypeFamily::Date
                | TypeFamily::Time
                | TypeFamily::Json
                | TypeFamily::Other(_) => format!("{}::text AS {}", quoted, quoted),
                _ => quoted,
            },
        }
    }

    pub fn create_table_sql(&self, schema: &EntitySchema) -> String {
        let mut columns = vec![self.primary_key_column()];
        columns.extend(schema.properties().iter().map(|p| self.column_definition(p)));
        if schema.has_timestamps() {
            columns.push(self.timestamp_column(CREATED_AT_COLUMN));
            columns.push(self.timestamp_column(UPDATED_AT_COLUMN));
        }
        format!(
            "CREATE TABLE {} (\n  {}\n)",
            self.quote_ident(schema.table_name()),
            columns.join(",\n  ")
        )
    }

    pub fn create_index_sql(&self, table: &str, index: &IndexDef) -> String {
        let name = self.quote_ident(&index.name(table));
        let table_ident = self.quote_ident(table);
        let columns: Vec<String> = index.columns.iter().map(|c| self.quote_ident(c)).collect();

        match (index.kind, self) {
            (IndexKind::Unique, _) => format!(
                "CREATE UNIQUE INDEX {} ON {} ({})",
                name,
                table_ident,
                columns.join(", ")
            ),
            (IndexKind::Fulltext, Dialect::Postgres) => {
                let document: Vec<String> = columns
                    .iter()
                    .map(|c| format!("coalesce({}::text, '')", c))
                    .collect();
                format!(
                    "CREATE INDEX {} ON {} USING gin (to_tsvector('simple', {}))",
                    name,
                    table_ident,
                    document.join(" || ' ' || ")
                )
            }
            _ => format!(
                "CREATE INDEX {} ON {} ({})",
                name,
                table_ident,
                columns.join(", ")
            ),
        }
    }

    pub fn drop_index_sql(&self, name: &str) -> String {
        format!("DROP INDEX {}", self.quote_ident(name))
    }

    pub fn add_column_sql(&self, table: &str, property: &PropertyDef) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote_ident(table),
            self.add_column_definition(property)
        )
    }

    pub fn rename_column_sql(&self, table: &str, from: &str, to: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.quote_ident(table),
            self.quote_ident(from),
            self.quote_ident(to)
        )
    }

    pub fn drop_column_sql(&self, table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.quote_ident(table),
            self.quote_ident(column)
        )
    }

    pub fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE {}", self.quote_ident(table))
    }
}

/// Zero value used to backfill a NOT NULL column added without a default
pub fn zero_value(family: &TypeFamily) -> Value {
    match family {
        TypeFamily::Integer => json!(0),
        TypeFamily::Float => json!(0.0),
        TypeFamily::Boolean => json!(false),
        TypeFamily::Timestamp => json!("1970-01-01 00:00:00"),
        TypeFamily::Date => json!("1970-01-01"),
        TypeFamily::Time => json!("00:00:00"),
        TypeFamily::Json => json!({}),
        TypeFamily::Text | TypeFamily::Other(_) => json!(""),
    }
}

pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Canonical form of a default expression as reported by a catalog
pub fn normalize_default(raw: &str) -> String {
    let mut s = raw.trim();
    while s.len() >= 2 && s.starts_with('(') && s.ends_with(')') {
        s = s[1..s.len() - 1].trim();
    }

    if s.starts_with('\'') {
        let mut end = None;
        let mut chars = s.char_indices().skip(1).peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if matches!(chars.peek(), Some((_, '\''))) {
                    chars.next();
                    continue;
                }
                end = Some(i);
                break;
            }
        }
        let quoted = match end {
            Some(i) => &s[..=i],
            None => s,
        };
        let inner = &quoted[1..quoted.len().saturating_sub(1).max(1)];
        if inner.parse::<f64>().is_ok() {
            return inner.to_string();
        }
        return quoted.to_string();
    }

    let s = match s.find("::") {
        Some(i) => s[..i].trim(),
        None => s,
    };
    s.to_ascii_lowercase()
}

/// Whether a declared default literal matches the live default expression
pub fn defaults_match(declared: &str, live: &str) -> bool {
    let a = normalize_default(declared);
    let b = normalize_default(live);
    if a == b {
        return true;
    }
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}
