//! Fixed-column layout for variable-arity tags.

use crate::error::Result;
use crate::types::Tag;

/// Number of positional columns before elements spill into `overflow`.
pub const TAG_SLOTS: usize = 4;

/// One tag as stored: four positional slots plus an ordered overflow list.
///
/// Slots are filled left to right, so the first `None` marks the end of the tag
/// unless elements continue in `overflow`, which is only non-empty when all four
/// slots are taken.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagRow {
    /// 0-based index among the owning event's tags.
    pub position: u32,
    /// Conventionally name, value, marker, amount.
    pub slots: [Option<String>; TAG_SLOTS],
    pub overflow: Vec<String>,
}

impl TagRow {
    pub fn from_tag(position: u32, tag: &Tag) -> Self {
        let mut slots: [Option<String>; TAG_SLOTS] = Default::default();
        for (slot, element) in slots.iter_mut().zip(tag.0.iter()) {
            *slot = Some(element.clone());
        }
        let overflow = tag.0.iter().skip(TAG_SLOTS).cloned().collect();
        Self {
            position,
            slots,
            overflow,
        }
    }

    pub fn into_tag(self) -> Tag {
        let mut elements: Vec<String> = self.slots.into_iter().map_while(|s| s).collect();
        elements.extend(self.overflow);
        Tag(elements)
    }

    /// Overflow column as stored (a JSON array, `[]` when empty).
    pub fn overflow_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.overflow)?)
    }

    /// Rebuild from the stored columns.
    pub fn from_columns(
        position: u32,
        slots: [Option<String>; TAG_SLOTS],
        overflow_json: &str,
    ) -> Result<Self> {
        let overflow: Vec<String> = serde_json::from_str(overflow_json)
            .map_err(|e| crate::error::SyncError::Deserialization(e.to_string()))?;
        Ok(Self {
            position,
            slots,
            overflow,
        })
    }
}

/// Map every tag of an event to its stored row, positions in order.
pub fn tag_rows(tags: &[Tag]) -> Vec<TagRow> {
    tags.iter()
        .enumerate()
        .map(|(i, tag)| TagRow::from_tag(i as u32, tag))
        .collect()
}
