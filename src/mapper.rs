use crate::db::PersistedRecord;
use crate::fetch::{NamedNode, RawCatalogItem};
use crate::text::normalize;

/// Flatten one raw catalog item into a table row.
///
/// Items without an id are skipped; every other missing piece falls back to
/// null or an empty list.
pub fn map_record(item: &RawCatalogItem) -> Option<PersistedRecord> {
    let id = item.id?;
    let title = item.title.as_ref();

    Some(PersistedRecord {
        id,
        title_romaji: title.and_then(|t| t.romaji.clone()),
        title_english: title.and_then(|t| t.english.clone()),
        description: normalize(item.description.as_deref()),
        genres: item
            .genres
            .iter()
            .flatten()
            .cloned()
            .collect(),
        tags: names(item.tags.as_deref()),
        average_score: item.average_score,
        studios: names(
            item.studios
                .as_ref()
                .and_then(|s| s.nodes.as_deref()),
        ),
    })
}

/// Map a whole page, dropping items that have no id.
pub fn map_page(items: &[RawCatalogItem]) -> Vec<PersistedRecord> {
    items.iter().filter_map(map_record).collect()
}

fn names(nodes: Option<&[NamedNode]>) -> Vec<String> {
    nodes
        .unwrap_or_default()
        .iter()
        .filter_map(|n| n.name.clone())
        .filter(|n| !n.is_empty())
        .collect()
}
