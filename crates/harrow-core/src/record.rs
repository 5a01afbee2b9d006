use serde::{Deserialize, Serialize};

use crate::element::Element;
use crate::selection::Selection;

/// Serialized form of an [`Element`].
///
/// Catalogs written before the mass-storage-domain rework carry the V3 shape;
/// readers must accept both, writers emit `Current` unless the element's
/// `write_v3` flag asks for the legacy form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "v")]
pub enum ElementRecord {
    #[serde(rename = "3")]
    V3 {
        url: String,
        dir: String,
        obj: String,
        first: i64,
        num: i64,
    },
    #[serde(rename = "current")]
    Current {
        url: String,
        dir: String,
        obj: String,
        first: i64,
        num: i64,
        msd: String,
        offset: i64,
        entries: i64,
        selection: Option<Selection>,
    },
}

impl Element {
    pub fn to_record(&self) -> ElementRecord {
        if self.write_v3 {
            ElementRecord::V3 {
                url: self.url.clone(),
                dir: self.dir.clone(),
                obj: self.obj.clone(),
                first: self.first,
                num: self.num,
            }
        } else {
            ElementRecord::Current {
                url: self.url.clone(),
                dir: self.dir.clone(),
                obj: self.obj.clone(),
                first: self.first,
                num: self.num,
                msd: self.msd.clone(),
                offset: self.offset,
                entries: self.entries,
                selection: self.selection.clone(),
            }
        }
    }

    pub fn from_record(record: ElementRecord) -> Element {
        match record {
            ElementRecord::V3 {
                url,
                dir,
                obj,
                first,
                num,
            } => {
                let mut e = Element::new(url, dir, obj, first, num, "");
                // An element read from a legacy catalog keeps writing the
                // legacy form until the caller says otherwise.
                e.write_v3 = true;
                e
            }
            ElementRecord::Current {
                url,
                dir,
                obj,
                first,
                num,
                msd,
                offset,
                entries,
                selection,
            } => {
                let mut e = Element::new(url, dir, obj, first, num, msd);
                e.offset = offset;
                e.entries = entries;
                e.selection = selection;
                e
            }
        }
    }
}
