use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde_json::{Map, Value};

use crate::ImageDocument;

pub const DEFAULT_LIMIT: usize = 20;

/// Root under which user metadata lives in a stored document.
pub const METADATA_ROOT: &str = "metadata";

/// A search over one owner's images.
///
/// Backends translate the query into whatever form they need, but every
/// backend must honour the same contract: equality filters on dotted metadata
/// paths, an inclusive `from`/`to` window on the creation date, newest images
/// first (identifier breaks ties), then `offset` and `limit`.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(default)]
pub struct ImageQuery {
    pub metadata_query: Map<String, Value>,
    pub limit: usize,
    pub offset: usize,
    #[builder(setter(strip_option))]
    pub from: Option<DateTime<Utc>>,
    #[builder(setter(strip_option))]
    pub to: Option<DateTime<Utc>>,
}

impl Default for ImageQuery {
    fn default() -> Self {
        Self {
            metadata_query: Map::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            from: None,
            to: None,
        }
    }
}

/// Equality condition on a dotted document path, e.g. `metadata.brewery`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataFilter {
    pub path: String,
    pub value: Value,
}

impl MetadataFilter {
    pub fn matches(&self, document: &ImageDocument) -> bool {
        let Some(relative) = self
            .path
            .strip_prefix(METADATA_ROOT)
            .and_then(|p| p.strip_prefix('.'))
        else {
            return false;
        };
        document.metadata.lookup(relative) == Some(&self.value)
    }
}

impl ImageQuery {
    /// Flattens nested objects in the metadata query into dotted paths rooted
    /// at [`METADATA_ROOT`]. Keys that already contain dots are kept as they
    /// are. The result is sorted by path.
    pub fn metadata_filters(&self) -> Vec<MetadataFilter> {
        let mut filters = Vec::new();
        flatten(METADATA_ROOT, &self.metadata_query, &mut filters);
        filters.sort_by(|a, b| a.path.cmp(&b.path));
        filters
    }

    fn in_window(&self, document: &ImageDocument) -> bool {
        let added = document.image.added;
        self.from.is_none_or(|from| added >= from) && self.to.is_none_or(|to| added <= to)
    }

    /// Evaluates the query over all documents of one owner.
    pub fn select(&self, documents: impl IntoIterator<Item = ImageDocument>) -> Vec<ImageDocument> {
        let filters = self.metadata_filters();
        let mut matched: Vec<ImageDocument> = documents
            .into_iter()
            .filter(|doc| self.in_window(doc))
            .filter(|doc| filters.iter().all(|f| f.matches(doc)))
            .collect();
        matched.sort_by(newest_first);
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

fn newest_first(a: &ImageDocument, b: &ImageDocument) -> Ordering {
    b.image
        .added
        .cmp(&a.image.added)
        .then_with(|| a.image.identifier.cmp(&b.image.identifier))
}

fn flatten(prefix: &str, fields: &Map<String, Value>, out: &mut Vec<MetadataFilter>) {
    for (key, value) in fields {
        let path = format!("{prefix}.{key}");
        match value {
            Value::Object(nested) if !nested.is_empty() => flatten(&path, nested, out),
            _ => out.push(MetadataFilter {
                path,
                value: value.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;
    use crate::{
        test_objects::tests::{mock_document, TEST_OWNER},
        MetadataRecord,
    };

    fn query_map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_dotted_notation_for_metadata_query() {
        let query = ImageQueryBuilder::default()
            .metadata_query(query_map(json!({
                "style": "IPA",
                "brewery": "Nøgne Ø",
            })))
            .limit(10)
            .build()
            .unwrap();

        assert_eq!(
            vec![
                MetadataFilter {
                    path: "metadata.brewery".to_string(),
                    value: json!("Nøgne Ø"),
                },
                MetadataFilter {
                    path: "metadata.style".to_string(),
                    value: json!("IPA"),
                },
            ],
            query.metadata_filters()
        );
        assert_eq!(10, query.limit);
        assert_eq!(0, query.offset);
    }

    #[test]
    fn test_nested_objects_are_flattened() {
        let query = ImageQueryBuilder::default()
            .metadata_query(query_map(json!({
                "brewery": {"country": "NO", "city": "Grimstad"},
                "tags.first": "beer",
            })))
            .build()
            .unwrap();
        let paths: Vec<String> = query
            .metadata_filters()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(
            vec![
                "metadata.brewery.city",
                "metadata.brewery.country",
                "metadata.tags.first"
            ],
            paths
        );
    }

    #[test]
    fn test_select_filters_orders_and_paginates() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut docs = Vec::new();
        for (i, style) in ["IPA", "Stout", "IPA", "IPA"].iter().enumerate() {
            let mut doc = mock_document(TEST_OWNER, &format!("img{i}"), base + Duration::hours(i as i64));
            doc.metadata = MetadataRecord::try_from(json!({"style": style})).unwrap();
            docs.push(doc);
        }

        let query = ImageQueryBuilder::default()
            .metadata_query(query_map(json!({"style": "IPA"})))
            .build()
            .unwrap();
        let ids: Vec<String> = query
            .select(docs.clone())
            .into_iter()
            .map(|d| d.image.identifier)
            .collect();
        assert_eq!(vec!["img3", "img2", "img0"], ids);

        let query = ImageQueryBuilder::default()
            .limit(1)
            .offset(1)
            .build()
            .unwrap();
        let ids: Vec<String> = query
            .select(docs.clone())
            .into_iter()
            .map(|d| d.image.identifier)
            .collect();
        assert_eq!(vec!["img2"], ids);

        let query = ImageQueryBuilder::default()
            .from(base + Duration::hours(1))
            .to(base + Duration::hours(2))
            .build()
            .unwrap();
        let ids: Vec<String> = query
            .select(docs)
            .into_iter()
            .map(|d| d.image.identifier)
            .collect();
        assert_eq!(vec!["img2", "img1"], ids);
    }

    #[test]
    fn test_identifier_breaks_ties() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let docs = vec![
            mock_document(TEST_OWNER, "b", at),
            mock_document(TEST_OWNER, "a", at),
        ];
        let ids: Vec<String> = ImageQuery::default()
            .select(docs)
            .into_iter()
            .map(|d| d.image.identifier)
            .collect();
        assert_eq!(vec!["a", "b"], ids);
    }
}
