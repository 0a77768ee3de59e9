//! Schema representation types.
//!
//! Field types are what the form builder exposes; column types are what the
//! mirrored table stores. The mapping between them is a closed table so an
//! unsupported type is rejected when it is parsed, never silently coerced.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::MigrateError;

/// Field types offered by the form builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Single-line text.
    ShortAnswer,
    /// Multi-line text.
    Paragraph,
    /// Email address.
    Email,
    /// Phone number.
    Phone,
    /// Decimal number.
    Number,
    /// Web address.
    Url,
    /// Uploaded document. Never mirrored.
    FileUpload,
    /// Uploaded image. Never mirrored.
    ImageUpload,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// Date and time.
    Datetime,
    /// One option out of a list.
    MultipleChoice,
    /// Yes/no choice.
    Checkbox,
    /// Star rating.
    Rating,
    /// Numeric slider.
    Slider,
    /// Geographic point.
    LatLong,
    /// Province picker.
    Province,
    /// Factory picker.
    Factory,
}

impl FieldType {
    /// All field types, in builder order.
    pub const ALL: [Self; 18] = [
        Self::ShortAnswer,
        Self::Paragraph,
        Self::Email,
        Self::Phone,
        Self::Number,
        Self::Url,
        Self::FileUpload,
        Self::ImageUpload,
        Self::Date,
        Self::Time,
        Self::Datetime,
        Self::MultipleChoice,
        Self::Checkbox,
        Self::Rating,
        Self::Slider,
        Self::LatLong,
        Self::Province,
        Self::Factory,
    ];

    /// Returns the wire name of this field type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortAnswer => "short_answer",
            Self::Paragraph => "paragraph",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Number => "number",
            Self::Url => "url",
            Self::FileUpload => "file_upload",
            Self::ImageUpload => "image_upload",
            Self::Date => "date",
            Self::Time => "time",
            Self::Datetime => "datetime",
            Self::MultipleChoice => "multiple_choice",
            Self::Checkbox => "checkbox",
            Self::Rating => "rating",
            Self::Slider => "slider",
            Self::LatLong => "lat_long",
            Self::Province => "province",
            Self::Factory => "factory",
        }
    }

    /// Returns the column type used in the mirrored table.
    ///
    /// Attachment types return `None`: their content stays in the EAV store
    /// and is never mirrored.
    #[must_use]
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Self::ShortAnswer | Self::Email | Self::Phone | Self::Url => {
                Some(ColumnType::Varchar(255))
            }
            Self::Province | Self::Factory => Some(ColumnType::Varchar(255)),
            Self::Paragraph | Self::MultipleChoice => Some(ColumnType::Text),
            Self::Number | Self::Slider => Some(ColumnType::Numeric),
            Self::Rating => Some(ColumnType::Integer),
            Self::Date => Some(ColumnType::Date),
            Self::Time => Some(ColumnType::Time),
            Self::Datetime => Some(ColumnType::Timestamp),
            Self::Checkbox => Some(ColumnType::Boolean),
            Self::LatLong => Some(ColumnType::Point),
            Self::FileUpload | Self::ImageUpload => None,
        }
    }

    /// Returns true if fields of this type get a column.
    #[must_use]
    pub fn is_mirrored(&self) -> bool {
        self.column_type().is_some()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MigrateError::UnknownFieldType(s.to_string()))
    }
}

/// Column types of mirrored tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// Bounded text.
    Varchar(u16),
    /// Unbounded text.
    Text,
    /// 64-bit integer.
    Integer,
    /// Arbitrary-precision number.
    Numeric,
    /// Boolean stored as 0/1.
    Boolean,
    /// `YYYY-MM-DD`.
    Date,
    /// `HH:MM:SS`.
    Time,
    /// `YYYY-MM-DD HH:MM:SS`, UTC.
    Timestamp,
    /// `lat,lng`.
    Point,
}

impl ColumnType {
    /// Returns the declared SQL type name.
    #[must_use]
    pub fn sql_name(&self) -> String {
        match self {
            Self::Varchar(len) => format!("VARCHAR({len})"),
            Self::Text => "TEXT".to_string(),
            Self::Integer => "INTEGER".to_string(),
            Self::Numeric => "NUMERIC".to_string(),
            Self::Boolean => "BOOLEAN".to_string(),
            Self::Date => "DATE".to_string(),
            Self::Time => "TIME".to_string(),
            Self::Timestamp => "TIMESTAMP".to_string(),
            Self::Point => "POINT".to_string(),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_name())
    }
}

impl FromStr for ColumnType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        if let Some(len) = normalized
            .strip_prefix("VARCHAR(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return len
                .trim()
                .parse()
                .map(Self::Varchar)
                .map_err(|_| MigrateError::UnknownColumnType(s.to_string()));
        }
        match normalized.as_str() {
            "TEXT" => Ok(Self::Text),
            "INTEGER" => Ok(Self::Integer),
            "NUMERIC" => Ok(Self::Numeric),
            "BOOLEAN" => Ok(Self::Boolean),
            "DATE" => Ok(Self::Date),
            "TIME" => Ok(Self::Time),
            "TIMESTAMP" => Ok(Self::Timestamp),
            "POINT" => Ok(Self::Point),
            _ => Err(MigrateError::UnknownColumnType(s.to_string())),
        }
    }
}

/// A single stored value, as captured in backups and written back on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    /// SQL NULL.
    Null,
    /// Integer storage class.
    Integer(i64),
    /// Real storage class.
    Real(f64),
    /// Text storage class.
    Text(String),
}

impl CellValue {
    /// Returns true for NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Renders the value as text (for error messages).
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Real(r) => r.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

/// Conversion applied to every value when a column changes type.
///
/// A cast either converts a value or rejects it; there is no lossy
/// fallback. Empty text becomes NULL for non-text targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cast {
    /// Type the values currently have.
    pub from: ColumnType,
    /// Type the values are converted to.
    pub to: ColumnType,
}

impl Cast {
    /// Returns the cast for an old/new type pair.
    #[must_use]
    pub fn between(from: ColumnType, to: ColumnType) -> Self {
        Self { from, to }
    }

    /// Converts a value, or returns `None` if it cannot be represented in
    /// the target type.
    #[must_use]
    pub fn apply(&self, value: &CellValue) -> Option<CellValue> {
        if value.is_null() {
            return Some(CellValue::Null);
        }
        if let CellValue::Text(text) = value {
            if text.trim().is_empty() && !is_textual(self.to) {
                return Some(CellValue::Null);
            }
        }
        match self.to {
            ColumnType::Text => Some(CellValue::Text(self.render_text(value))),
            ColumnType::Varchar(len) => {
                let text = self.render_text(value);
                (text.chars().count() <= usize::from(len)).then_some(CellValue::Text(text))
            }
            ColumnType::Integer => cast_integer(value),
            ColumnType::Numeric => cast_numeric(value),
            ColumnType::Boolean => cast_boolean(value),
            ColumnType::Date => {
                let text = text_of(value)?;
                parse_date(text).map(|d| CellValue::Text(d.format("%Y-%m-%d").to_string()))
            }
            ColumnType::Time => {
                let text = text_of(value)?;
                parse_time(text).map(|t| CellValue::Text(t.format("%H:%M:%S").to_string()))
            }
            ColumnType::Timestamp => {
                let text = text_of(value)?;
                parse_timestamp(text)
                    .map(|ts| CellValue::Text(ts.format("%Y-%m-%d %H:%M:%S").to_string()))
            }
            ColumnType::Point => {
                let text = text_of(value)?;
                parse_point(text).map(|(lat, lng)| CellValue::Text(format!("{lat},{lng}")))
            }
        }
    }

    // Booleans read back as words when they leave a boolean column.
    fn render_text(&self, value: &CellValue) -> String {
        match (self.from, value) {
            (ColumnType::Boolean, CellValue::Integer(0)) => "false".to_string(),
            (ColumnType::Boolean, CellValue::Integer(1)) => "true".to_string(),
            _ => value.to_text(),
        }
    }
}

impl fmt::Display for Cast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

fn is_textual(column_type: ColumnType) -> bool {
    matches!(column_type, ColumnType::Text | ColumnType::Varchar(_))
}

fn text_of(value: &CellValue) -> Option<&str> {
    match value {
        CellValue::Text(text) => Some(text.trim()),
        _ => None,
    }
}

fn cast_integer(value: &CellValue) -> Option<CellValue> {
    match value {
        CellValue::Integer(i) => Some(CellValue::Integer(*i)),
        #[allow(clippy::cast_possible_truncation)]
        CellValue::Real(r) if r.is_finite() && r.fract() == 0.0 => {
            Some(CellValue::Integer(*r as i64))
        }
        CellValue::Text(text) => text.trim().parse().ok().map(CellValue::Integer),
        _ => None,
    }
}

fn cast_numeric(value: &CellValue) -> Option<CellValue> {
    match value {
        CellValue::Integer(i) => Some(CellValue::Integer(*i)),
        CellValue::Real(r) if r.is_finite() => Some(CellValue::Real(*r)),
        CellValue::Text(text) => {
            let text = text.trim();
            if let Ok(i) = text.parse::<i64>() {
                return Some(CellValue::Integer(i));
            }
            text.parse::<f64>()
                .ok()
                .filter(|r| r.is_finite())
                .map(CellValue::Real)
        }
        _ => None,
    }
}

fn cast_boolean(value: &CellValue) -> Option<CellValue> {
    let truth = match value {
        CellValue::Integer(0) => false,
        CellValue::Integer(1) => true,
        CellValue::Real(r) if *r == 0.0 => false,
        CellValue::Real(r) if (*r - 1.0).abs() < f64::EPSILON => true,
        CellValue::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "yes" | "y" => true,
            "0" | "false" | "f" | "no" | "n" => false,
            _ => return None,
        },
        _ => return None,
    };
    Some(CellValue::Integer(i64::from(truth)))
}

/// Parses a timestamp in any of the accepted layouts.
#[must_use]
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.naive_utc());
    }
    const LAYOUTS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(text, layout).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(text).map(|ts| ts.date()))
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .ok()
        .or_else(|| parse_timestamp(text).map(|ts| ts.time()))
}

fn parse_point(text: &str) -> Option<(f64, f64)> {
    let inner = text.trim_start_matches('(').trim_end_matches(')');
    let (lat, lng) = inner.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lng: f64 = lng.trim().parse().ok()?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)).then_some((lat, lng))
}

/// A field as persisted by the form builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Stable identity.
    pub id: String,
    /// Owning form.
    pub form_id: String,
    /// Owning sub-form, if any.
    pub sub_form_id: Option<String>,
    /// Column in the mirrored table.
    pub column_name: String,
    /// Field type.
    pub field_type: FieldType,
    /// Display title.
    pub title: String,
}

impl FieldDefinition {
    /// Creates a top-level field definition.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        form_id: impl Into<String>,
        column_name: impl Into<String>,
        field_type: FieldType,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            form_id: form_id.into(),
            sub_form_id: None,
            column_name: column_name.into(),
            field_type,
            title: title.into(),
        }
    }

    /// Places the field inside a sub-form.
    #[must_use]
    pub fn in_sub_form(mut self, sub_form_id: impl Into<String>) -> Self {
        self.sub_form_id = Some(sub_form_id.into());
        self
    }
}

/// A field as submitted in a form update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInput {
    /// Identity carried over from an existing field; `None` for new fields.
    pub id: Option<String>,
    /// Display title.
    pub title: String,
    /// Field type.
    pub field_type: FieldType,
    /// Desired column name; `None` lets the naming service pick one.
    pub column_name: Option<String>,
}

impl FieldInput {
    /// Creates an input for a brand-new field.
    #[must_use]
    pub fn new(title: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: None,
            title: title.into(),
            field_type,
            column_name: None,
        }
    }

    /// Carries the identity of an existing field.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Requests a specific column name.
    #[must_use]
    pub fn with_column(mut self, column_name: impl Into<String>) -> Self {
        self.column_name = Some(column_name.into());
        self
    }
}

impl From<&FieldDefinition> for FieldInput {
    fn from(field: &FieldDefinition) -> Self {
        Self {
            id: Some(field.id.clone()),
            title: field.title.clone(),
            field_type: field.field_type,
            column_name: Some(field.column_name.clone()),
        }
    }
}

/// A sub-form nested in a form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubFormSchema {
    /// Sub-form identity.
    pub id: String,
    /// Parent form.
    pub form_id: String,
    /// Display title.
    pub title: String,
    /// Mirrored table, once created.
    pub table_name: Option<String>,
    /// Fields of the sub-form.
    pub fields: Vec<FieldInput>,
}

/// A form and its mirrored table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSchema {
    /// Form identity.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Mirrored table; `None` until first materialized.
    pub table_name: Option<String>,
    /// Top-level fields.
    pub fields: Vec<FieldInput>,
}

impl FormSchema {
    /// Creates a form that has never been materialized.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            table_name: None,
            fields: Vec::new(),
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldInput) -> Self {
        self.fields.push(field);
        self
    }
}

/// Foreign key action (ON DELETE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForeignKeyAction {
    /// Cascade the delete to referencing rows.
    Cascade,
}

impl ForeignKeyAction {
    /// Returns the SQL representation of this action.
    #[must_use]
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
        }
    }
}

/// Inline column reference to another table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeySchema {
    /// Referenced table name.
    pub references_table: String,
    /// Referenced column.
    pub references_column: String,
    /// Action on delete.
    pub on_delete: ForeignKeyAction,
}

/// Schema definition for a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Column type.
    pub column_type: ColumnType,
    /// Whether the column allows NULL values.
    pub nullable: bool,
    /// Whether this column is the primary key.
    pub primary_key: bool,
    /// Default expression (e.g. `CURRENT_TIMESTAMP`).
    pub default: Option<String>,
    /// Foreign key, if any.
    pub references: Option<ForeignKeySchema>,
}

impl ColumnSchema {
    /// Creates a new nullable column schema.
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            primary_key: false,
            default: None,
            references: None,
        }
    }

    /// Sets the column as NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the column as the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Sets the default expression.
    #[must_use]
    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Adds a foreign key to `table(column)`.
    #[must_use]
    pub fn references(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        on_delete: ForeignKeyAction,
    ) -> Self {
        self.references = Some(ForeignKeySchema {
            references_table: table.into(),
            references_column: column.into(),
            on_delete,
        });
        self
    }
}

/// Complete schema definition for a dynamic table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Column definitions.
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Creates a new table schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Adds a column to the table.
    #[must_use]
    pub fn column(mut self, column: ColumnSchema) -> Self {
        self.columns.push(column);
        self
    }
}

/// A column as reported by the live database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared type, verbatim.
    pub declared_type: String,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

impl ColumnInfo {
    /// Returns the parsed column type, if it is one of ours.
    #[must_use]
    pub fn column_type(&self) -> Option<ColumnType> {
        self.declared_type.parse().ok()
    }
}
