use crate::{error::InvalidMetadataError, item::ItemId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const KEY_ID: &str = "publishedfileid";
pub const KEY_TITLE: &str = "title";
pub const KEY_PREVIEW_URL: &str = "preview_url";
pub const KEY_TAGS: &str = "tags";

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    id: ItemId,
    title: String,
    preview_url: String,
    tags: Vec<String>,
    raw: Value,
}

impl MetadataRecord {
    pub fn from_remote(requested: ItemId, raw: Value) -> Result<Self, InvalidMetadataError> {
        let object = raw.as_object().ok_or(InvalidMetadataError::NotAnObject)?;
        let found = match object.get(KEY_ID) {
            Some(value) => read_id(value)?,
            None => return Err(InvalidMetadataError::MissingField(KEY_ID)),
        };
        if found != requested.get() {
            return Err(InvalidMetadataError::IdMismatch {
                expected: requested,
                found,
            });
        }
        Self::build(requested, raw)
    }

    /// Builds a record from a persisted cache entry. The entry's own id is
    /// authoritative; an embedded id, when present, must agree with it.
    pub fn from_stored(id: ItemId, raw: Value) -> Result<Self, InvalidMetadataError> {
        let object = raw.as_object().ok_or(InvalidMetadataError::NotAnObject)?;
        if let Some(value) = object.get(KEY_ID) {
            let found = read_id(value)?;
            if found != id.get() {
                return Err(InvalidMetadataError::IdMismatch { expected: id, found });
            }
        }
        Self::build(id, raw)
    }

    fn build(id: ItemId, raw: Value) -> Result<Self, InvalidMetadataError> {
        let object = raw.as_object().ok_or(InvalidMetadataError::NotAnObject)?;
        let title = read_string(object, KEY_TITLE)?;
        let preview_url = read_string(object, KEY_PREVIEW_URL)?;
        let tags = read_tags(object)?;
        Ok(Self {
            id,
            title,
            preview_url,
            tags,
            raw,
        })
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn preview_url(&self) -> &str {
        &self.preview_url
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn to_entry(&self) -> CacheEntry {
        CacheEntry {
            key: self.id,
            value: StoredRecord {
                id: self.id,
                data: self.raw.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: ItemId,
    pub value: StoredRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: ItemId,
    pub data: Value,
}

impl CacheEntry {
    pub fn into_record(self) -> Result<MetadataRecord, InvalidMetadataError> {
        if self.key != self.value.id {
            return Err(InvalidMetadataError::IdMismatch {
                expected: self.key,
                found: self.value.id.get(),
            });
        }
        MetadataRecord::from_stored(self.key, self.value.data)
    }
}

// The Steam API sends ids as decimal strings; older caches stored numbers.
fn read_id(value: &Value) -> Result<u64, InvalidMetadataError> {
    let wrong = InvalidMetadataError::WrongType { field: KEY_ID };
    match value {
        Value::Number(number) => number.as_u64().ok_or(wrong),
        Value::String(text) => text.trim().parse::<u64>().map_err(|_| wrong),
        _ => Err(wrong),
    }
}

fn read_string(object: &Map<String, Value>, field: &'static str) -> Result<String, InvalidMetadataError> {
    match object.get(field) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(InvalidMetadataError::WrongType { field }),
        None => Err(InvalidMetadataError::MissingField(field)),
    }
}

// Tags arrive either as plain strings or as `{ "tag": "..." }` objects.
fn read_tags(object: &Map<String, Value>) -> Result<Vec<String>, InvalidMetadataError> {
    let wrong = InvalidMetadataError::WrongType { field: KEY_TAGS };
    let items = match object.get(KEY_TAGS) {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(wrong),
        None => return Err(InvalidMetadataError::MissingField(KEY_TAGS)),
    };
    let mut tags = Vec::with_capacity(items.len());
    for item in items {
        let tag = match item {
            Value::String(text) => text.as_str(),
            Value::Object(map) => map.get("tag").and_then(Value::as_str).ok_or(wrong.clone())?,
            _ => return Err(wrong),
        };
        tags.push(tag.to_string());
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: u64) -> ItemId {
        ItemId::new(raw).unwrap()
    }

    fn details(raw_id: Value) -> Value {
        json!({
            "publishedfileid": raw_id,
            "title": "Frackin' Universe",
            "preview_url": "https://example.invalid/fu.png",
            "tags": [{ "tag": "Mod" }, { "tag": "Furniture" }],
            "file_size": 123
        })
    }

    #[test]
    fn remote_record_accepts_string_ids_and_tag_objects() {
        let record = MetadataRecord::from_remote(id(729480149), details(json!("729480149"))).unwrap();
        assert_eq!(record.id(), id(729480149));
        assert_eq!(record.title(), "Frackin' Universe");
        assert_eq!(record.tags(), ["Mod".to_string(), "Furniture".to_string()]);
        assert_eq!(record.raw()["file_size"], json!(123));
    }

    #[test]
    fn remote_record_rejects_other_item() {
        let err = MetadataRecord::from_remote(id(1), details(json!(2))).unwrap_err();
        assert_eq!(err, InvalidMetadataError::IdMismatch { expected: id(1), found: 2 });
    }

    #[test]
    fn every_required_field_is_checked() {
        for field in [KEY_ID, KEY_TITLE, KEY_PREVIEW_URL, KEY_TAGS] {
            let mut doc = details(json!(5));
            doc.as_object_mut().unwrap().remove(field);
            let err = MetadataRecord::from_remote(id(5), doc).unwrap_err();
            assert_eq!(err, InvalidMetadataError::MissingField(field));
        }
    }

    #[test]
    fn wrong_types_are_rejected() {
        let mut doc = details(json!(5));
        doc["tags"] = json!("Mod");
        assert_eq!(
            MetadataRecord::from_remote(id(5), doc).unwrap_err(),
            InvalidMetadataError::WrongType { field: KEY_TAGS }
        );
        assert_eq!(
            MetadataRecord::from_remote(id(5), json!([1, 2])).unwrap_err(),
            InvalidMetadataError::NotAnObject
        );
    }

    #[test]
    fn stored_record_without_embedded_id_uses_entry_id() {
        let data = json!({ "title": "Optimizebound", "preview_url": "", "tags": ["Mod"] });
        let record = MetadataRecord::from_stored(id(9), data).unwrap();
        assert_eq!(record.id(), id(9));
        assert_eq!(record.preview_url(), "");
    }

    #[test]
    fn entry_key_must_match_value_id() {
        let entry: CacheEntry = serde_json::from_value(json!({
            "key": 3,
            "value": { "id": 4, "data": { "title": "x", "preview_url": "", "tags": [] } }
        }))
        .unwrap();
        assert!(entry.into_record().is_err());
    }

    #[test]
    fn entry_shape_matches_cache_file_layout() {
        let record = MetadataRecord::from_remote(id(5), details(json!("5"))).unwrap();
        let value = serde_json::to_value(record.to_entry()).unwrap();
        assert_eq!(value["key"], json!(5));
        assert_eq!(value["value"]["id"], json!(5));
        assert_eq!(value["value"]["data"]["title"], json!("Frackin' Universe"));
    }
}
