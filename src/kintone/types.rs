//! kintone record and field representations.
//!
//! A record on the wire is a map of field code → `{"type": …, "value": …}`.
//! [`FieldValue`] models that as a tagged variant per field type so cleaning
//! and display logic is exhaustive matching rather than type-string
//! comparisons; unrecognized types round-trip verbatim through [`FieldValue::Unknown`].

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record as captured: field code → typed value. `BTreeMap` keeps field
/// order deterministic across serialize/deserialize cycles.
pub type Record = BTreeMap<String, FieldValue>;

// ============================================================================
// Field payload shapes
// ============================================================================

/// A user/org/group reference as kintone returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub code: String,
    #[serde(default)]
    pub name: String,
}

/// One attachment reference inside a FILE field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(rename = "contentType", default)]
    pub content_type: Option<String>,
    #[serde(rename = "fileKey")]
    pub file_key: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<String>,
}

/// One row of a SUBTABLE field; `value` is a nested record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtableRow {
    #[serde(default)]
    pub id: Option<String>,
    pub value: Record,
}

// ============================================================================
// FieldValue
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    RecordNumber(Option<String>),
    Id(Option<String>),
    Revision(Option<String>),
    Creator(Option<EntityRef>),
    Modifier(Option<EntityRef>),
    CreatedTime(Option<String>),
    UpdatedTime(Option<String>),
    SingleLineText(Option<String>),
    MultiLineText(Option<String>),
    RichText(Option<String>),
    Number(Option<String>),
    Calc(Option<String>),
    Date(Option<String>),
    Time(Option<String>),
    DateTime(Option<String>),
    Link(Option<String>),
    DropDown(Option<String>),
    RadioButton(Option<String>),
    CheckBox(Vec<String>),
    MultiSelect(Vec<String>),
    Category(Vec<String>),
    Status(Option<String>),
    StatusAssignee(Vec<EntityRef>),
    UserSelect(Vec<EntityRef>),
    OrganizationSelect(Vec<EntityRef>),
    GroupSelect(Vec<EntityRef>),
    File(Vec<FileRef>),
    Subtable(Vec<SubtableRow>),
    /// Any field type this crate does not model; kept verbatim so archives
    /// stay content-complete.
    Unknown { kind: String, value: Value },
}

impl FieldValue {
    /// The kintone field type string (the `"type"` tag on the wire).
    pub fn type_tag(&self) -> &str {
        match self {
            FieldValue::RecordNumber(_) => "RECORD_NUMBER",
            FieldValue::Id(_) => "__ID__",
            FieldValue::Revision(_) => "__REVISION__",
            FieldValue::Creator(_) => "CREATOR",
            FieldValue::Modifier(_) => "MODIFIER",
            FieldValue::CreatedTime(_) => "CREATED_TIME",
            FieldValue::UpdatedTime(_) => "UPDATED_TIME",
            FieldValue::SingleLineText(_) => "SINGLE_LINE_TEXT",
            FieldValue::MultiLineText(_) => "MULTI_LINE_TEXT",
            FieldValue::RichText(_) => "RICH_TEXT",
            FieldValue::Number(_) => "NUMBER",
            FieldValue::Calc(_) => "CALC",
            FieldValue::Date(_) => "DATE",
            FieldValue::Time(_) => "TIME",
            FieldValue::DateTime(_) => "DATETIME",
            FieldValue::Link(_) => "LINK",
            FieldValue::DropDown(_) => "DROP_DOWN",
            FieldValue::RadioButton(_) => "RADIO_BUTTON",
            FieldValue::CheckBox(_) => "CHECK_BOX",
            FieldValue::MultiSelect(_) => "MULTI_SELECT",
            FieldValue::Category(_) => "CATEGORY",
            FieldValue::Status(_) => "STATUS",
            FieldValue::StatusAssignee(_) => "STATUS_ASSIGNEE",
            FieldValue::UserSelect(_) => "USER_SELECT",
            FieldValue::OrganizationSelect(_) => "ORGANIZATION_SELECT",
            FieldValue::GroupSelect(_) => "GROUP_SELECT",
            FieldValue::File(_) => "FILE",
            FieldValue::Subtable(_) => "SUBTABLE",
            FieldValue::Unknown { kind, .. } => kind,
        }
    }

    /// The `"value"` half as plain JSON, shared by serialization and the
    /// record write shape sent on upserts.
    pub fn value_json(&self) -> Value {
        fn to_val<T: Serialize>(v: &T) -> Value {
            serde_json::to_value(v).unwrap_or(Value::Null)
        }
        match self {
            FieldValue::RecordNumber(v)
            | FieldValue::Id(v)
            | FieldValue::Revision(v)
            | FieldValue::CreatedTime(v)
            | FieldValue::UpdatedTime(v)
            | FieldValue::SingleLineText(v)
            | FieldValue::MultiLineText(v)
            | FieldValue::RichText(v)
            | FieldValue::Number(v)
            | FieldValue::Calc(v)
            | FieldValue::Date(v)
            | FieldValue::Time(v)
            | FieldValue::DateTime(v)
            | FieldValue::Link(v)
            | FieldValue::DropDown(v)
            | FieldValue::RadioButton(v)
            | FieldValue::Status(v) => to_val(v),
            FieldValue::Creator(v) | FieldValue::Modifier(v) => to_val(v),
            FieldValue::CheckBox(v) | FieldValue::MultiSelect(v) | FieldValue::Category(v) => {
                to_val(v)
            }
            FieldValue::StatusAssignee(v)
            | FieldValue::UserSelect(v)
            | FieldValue::OrganizationSelect(v)
            | FieldValue::GroupSelect(v) => to_val(v),
            FieldValue::File(v) => to_val(v),
            FieldValue::Subtable(v) => to_val(v),
            FieldValue::Unknown { value, .. } => value.clone(),
        }
    }

    /// Build a typed value from the wire `type`/`value` pair. Types this
    /// crate does not model land in [`FieldValue::Unknown`].
    pub fn from_raw(kind: &str, value: Value) -> Result<FieldValue, serde_json::Error> {
        use serde_json::from_value as fv;
        Ok(match kind {
            "RECORD_NUMBER" => FieldValue::RecordNumber(fv(value)?),
            "__ID__" => FieldValue::Id(fv(value)?),
            "__REVISION__" => FieldValue::Revision(fv(value)?),
            "CREATOR" => FieldValue::Creator(fv(value)?),
            "MODIFIER" => FieldValue::Modifier(fv(value)?),
            "CREATED_TIME" => FieldValue::CreatedTime(fv(value)?),
            "UPDATED_TIME" => FieldValue::UpdatedTime(fv(value)?),
            "SINGLE_LINE_TEXT" => FieldValue::SingleLineText(fv(value)?),
            "MULTI_LINE_TEXT" => FieldValue::MultiLineText(fv(value)?),
            "RICH_TEXT" => FieldValue::RichText(fv(value)?),
            "NUMBER" => FieldValue::Number(fv(value)?),
            "CALC" => FieldValue::Calc(fv(value)?),
            "DATE" => FieldValue::Date(fv(value)?),
            "TIME" => FieldValue::Time(fv(value)?),
            "DATETIME" => FieldValue::DateTime(fv(value)?),
            "LINK" => FieldValue::Link(fv(value)?),
            "DROP_DOWN" => FieldValue::DropDown(fv(value)?),
            "RADIO_BUTTON" => FieldValue::RadioButton(fv(value)?),
            "CHECK_BOX" => FieldValue::CheckBox(fv(value)?),
            "MULTI_SELECT" => FieldValue::MultiSelect(fv(value)?),
            "CATEGORY" => FieldValue::Category(fv(value)?),
            "STATUS" => FieldValue::Status(fv(value)?),
            "STATUS_ASSIGNEE" => FieldValue::StatusAssignee(fv(value)?),
            "USER_SELECT" => FieldValue::UserSelect(fv(value)?),
            "ORGANIZATION_SELECT" => FieldValue::OrganizationSelect(fv(value)?),
            "GROUP_SELECT" => FieldValue::GroupSelect(fv(value)?),
            "FILE" => FieldValue::File(fv(value)?),
            "SUBTABLE" => FieldValue::Subtable(fv(value)?),
            other => FieldValue::Unknown {
                kind: other.to_string(),
                value,
            },
        })
    }

    /// Text content for single-valued string fields; used for business-key
    /// derivation and marker timestamps.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::RecordNumber(v)
            | FieldValue::Id(v)
            | FieldValue::Revision(v)
            | FieldValue::CreatedTime(v)
            | FieldValue::UpdatedTime(v)
            | FieldValue::SingleLineText(v)
            | FieldValue::MultiLineText(v)
            | FieldValue::RichText(v)
            | FieldValue::Number(v)
            | FieldValue::Calc(v)
            | FieldValue::Date(v)
            | FieldValue::Time(v)
            | FieldValue::DateTime(v)
            | FieldValue::Link(v)
            | FieldValue::DropDown(v)
            | FieldValue::RadioButton(v)
            | FieldValue::Status(v) => v.as_deref().filter(|s| !s.is_empty()),
            _ => None,
        }
    }

    /// System-managed or computed fields the service rejects on writes.
    pub fn is_readonly(&self) -> bool {
        matches!(
            self,
            FieldValue::RecordNumber(_)
                | FieldValue::Id(_)
                | FieldValue::Revision(_)
                | FieldValue::Creator(_)
                | FieldValue::Modifier(_)
                | FieldValue::CreatedTime(_)
                | FieldValue::UpdatedTime(_)
                | FieldValue::Status(_)
                | FieldValue::StatusAssignee(_)
                | FieldValue::Calc(_)
                | FieldValue::Category(_)
        )
    }
}

#[derive(Deserialize)]
struct RawField {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: Value,
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawField::deserialize(deserializer)?;
        FieldValue::from_raw(&raw.kind, raw.value).map_err(serde::de::Error::custom)
    }
}

impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", self.type_tag())?;
        map.serialize_entry("value", &self.value_json())?;
        map.end()
    }
}

// ============================================================================
// Record helpers
// ============================================================================

/// The record's internal `$id` value, wherever the field sits in the map.
pub fn record_id(record: &Record) -> Option<String> {
    record.values().find_map(|v| match v {
        FieldValue::Id(Some(id)) => Some(id.clone()),
        _ => None,
    })
}

/// The record's human-facing record number, if present.
pub fn record_number(record: &Record) -> Option<String> {
    record.values().find_map(|v| match v {
        FieldValue::RecordNumber(Some(n)) => Some(n.clone()),
        _ => None,
    })
}

/// The record's own updated-time value; feeds the per-record change marker.
pub fn updated_time(record: &Record) -> Option<String> {
    record.values().find_map(|v| match v {
        FieldValue::UpdatedTime(Some(t)) => Some(t.clone()),
        _ => None,
    })
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AppInfo {
    #[serde(rename = "appId")]
    pub app_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AppsResponse {
    pub apps: Vec<AppInfo>,
}

#[derive(Debug, Deserialize)]
pub struct RecordsResponse {
    pub records: Vec<Record>,
}

/// One field definition from the form-fields endpoint. Only the pieces the
/// engine needs; the archived schema snapshot is taken from this shape too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldProperty {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormFields {
    pub properties: std::collections::HashMap<String, FieldProperty>,
}

/// One update in a batched PUT: live record id + write-shape field map.
#[derive(Debug, Clone, Serialize)]
pub struct RecordUpdate {
    pub id: String,
    pub record: serde_json::Map<String, Value>,
}

/// Applied counts out of a batched upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub updated: usize,
    pub added: usize,
}
