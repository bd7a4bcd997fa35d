//! Line-oriented `key=value` records stored next to blob content.
//!
//! A record is an optional `#` comment line followed by one `key=value` line
//! per entry in key order. Backslash escapes cover `\`, newline, carriage
//! return, tab, `=` and `:` so any string survives a round trip.

use std::collections::{BTreeMap, btree_map};

use bytes::Bytes;

use crate::{BlobError, BlobResult, traits::StorageBackend};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.entries.iter()
    }

    pub fn encode(&self, comment: Option<&str>) -> Bytes {
        let mut out = String::new();
        if let Some(comment) = comment {
            for line in comment.lines() {
                out.push('#');
                out.push_str(line);
                out.push('\n');
            }
        }
        for (key, value) in &self.entries {
            escape_into(&mut out, key, true);
            out.push('=');
            escape_into(&mut out, value, false);
            out.push('\n');
        }
        Bytes::from(out)
    }

    pub fn decode(data: &[u8]) -> BlobResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| BlobError::consistency(format!("properties record is not UTF-8: {}", e)))?;
        let mut properties = Properties::new();
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let split = find_separator(line).ok_or_else(|| {
                BlobError::consistency(format!(
                    "properties line {} has no '=' separator",
                    number + 1
                ))
            })?;
            properties.set(unescape(&line[..split]), unescape(&line[split + 1..]));
        }
        Ok(properties)
    }
}

impl FromIterator<(String, String)> for Properties {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn escape_into(out: &mut String, text: &str, is_key: bool) {
    for (index, c) in text.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '=' => out.push_str("\\="),
            ':' => out.push_str("\\:"),
            '#' | '!' if is_key && index == 0 => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

/// Byte offset of the first `=` not preceded by an escaping backslash.
fn find_separator(line: &str) -> Option<usize> {
    let mut escaped = false;
    for (offset, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '=' => return Some(offset),
            _ => {}
        }
    }
    None
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Loads the record at `key`, or `None` when the object does not exist.
pub async fn load_properties(
    backend: &dyn StorageBackend,
    key: &str,
) -> BlobResult<Option<Properties>> {
    match backend.get_object(key).await {
        Ok(data) => Properties::decode(&data).map(Some),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn store_properties(
    backend: &dyn StorageBackend,
    key: &str,
    properties: &Properties,
    comment: Option<&str>,
) -> BlobResult<()> {
    backend.put_object(key, properties.encode(comment)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::InMemoryBackend;

    #[test]
    fn test_encode_sorts_and_comments() {
        let mut props = Properties::new();
        props.set("size", "10");
        props.set("@BlobStore.blob-name", "a/b");
        let text = String::from_utf8(props.encode(Some("written by test")).to_vec()).unwrap();
        assert_eq!(text, "#written by test\n@BlobStore.blob-name=a/b\nsize=10\n");
    }

    #[test]
    fn test_special_characters_survive() {
        let mut props = Properties::new();
        props.set("key=with:separators", "line1\nline2\r\ttab=\\end:");
        props.set("#hash", "  leading spaces");
        props.set("empty", "");
        let decoded = Properties::decode(&props.encode(None)).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn test_decode_skips_comments_and_blank_lines() {
        let decoded = Properties::decode(b"#comment\n\n! other comment\na=1\nb=x=y\n").unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.get("a"), Some("1"));
        assert_eq!(decoded.get("b"), Some("x=y"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Properties::decode(b"no separator here\n").is_err());
        assert!(Properties::decode(&[0xff, 0xfe, b'=']).is_err());
    }

    #[tokio::test]
    async fn test_load_missing_record_is_none() {
        let backend = InMemoryBackend::new("bucket");
        assert!(load_properties(&backend, "nothing.properties").await.unwrap().is_none());

        let mut props = Properties::new();
        props.set("type", "s3/1");
        store_properties(&backend, "metadata.properties", &props, None)
            .await
            .unwrap();
        assert_eq!(
            load_properties(&backend, "metadata.properties").await.unwrap(),
            Some(props)
        );
    }
}
