use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::selection::Selection;

/// Sentinel host for elements whose URL carries no usable host component.
pub const NO_HOST: &str = "no-host";

/// URL scheme of the native harrow data server.
pub const SCHEME_NATIVE: &str = "hrw";
/// Legacy remote-access scheme, still accepted for host mapping.
pub const SCHEME_LEGACY: &str = "xrd";

/// What the dataset's containers hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetKind {
    /// Each container holds a contiguous range of records.
    Records,
    /// Each container holds whole named objects.
    Objects,
}

/// One file of a dataset: its location plus the record sub-range to process.
///
/// `num == -1` means "to the end of the file". `entries` is `-1` until the
/// validation exchange fills in the file's true record count; `offset` is the
/// element's cumulative position in the dataset's logical record stream, also
/// computed during validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub url: String,
    pub dir: String,
    pub obj: String,
    pub first: i64,
    pub num: i64,
    pub msd: String,
    pub offset: i64,
    pub entries: i64,
    pub selection: Option<Selection>,
    /// Emit the legacy V3 record form when serializing. Not itself serialized;
    /// set when an element was read from a V3 record.
    #[serde(skip)]
    pub write_v3: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ElementError {
    #[error("element url must be non-empty")]
    EmptyUrl,
    #[error("first must be >= 0 (got {0})")]
    NegativeFirst(i64),
    #[error("num must be >= -1 (got {0})")]
    NumOutOfRange(i64),
}

impl Element {
    /// Builds an element, clamping out-of-contract `first`/`num` values.
    ///
    /// `first < 0` and `num < -1` are caller bugs but not fatal: they are
    /// warned about and clamped, matching the master's tolerance for sloppy
    /// dataset descriptions.
    pub fn new(
        url: impl Into<String>,
        dir: impl Into<String>,
        obj: impl Into<String>,
        first: i64,
        num: i64,
        msd: impl Into<String>,
    ) -> Self {
        let url = url.into();
        let mut first = first;
        let mut num = num;
        if first < 0 {
            warn!(url = %url, first, "element first < 0, clamping to 0");
            first = 0;
        }
        if num < -1 {
            warn!(url = %url, num, "element num < -1, clamping to -1");
            num = -1;
        }
        Self {
            url,
            dir: dir.into(),
            obj: obj.into(),
            first,
            num,
            msd: msd.into(),
            offset: 0,
            entries: -1,
            selection: None,
            write_v3: false,
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn validate(&self) -> Result<(), ElementError> {
        if self.url.trim().is_empty() {
            return Err(ElementError::EmptyUrl);
        }
        if self.first < 0 {
            return Err(ElementError::NegativeFirst(self.first));
        }
        if self.num < -1 {
            return Err(ElementError::NumOutOfRange(self.num));
        }
        Ok(())
    }

    /// True once the validation exchange has recorded the file's entry count.
    pub fn is_validated(&self) -> bool {
        self.entries >= 0
    }

    /// One past the last record of the element's range. Meaningful only when
    /// `num >= 0`.
    pub fn end(&self) -> i64 {
        self.first + self.num
    }

    /// Records this element contributes to the query: the selection's size
    /// when one is attached, the plain range size otherwise.
    pub fn entry_contribution(&self) -> i64 {
        match &self.selection {
            Some(sel) => sel.len(),
            None => self.num.max(0),
        }
    }

    /// Host the file lives on, for locality grouping.
    ///
    /// Anything that is not a parseable URL with a `hrw` or `xrd` scheme and a
    /// host component (plain paths included) groups under [`NO_HOST`].
    pub fn host(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(parsed)
                if parsed.scheme() == SCHEME_NATIVE || parsed.scheme() == SCHEME_LEGACY =>
            {
                match parsed.host_str() {
                    Some(host) if !host.is_empty() => host.to_string(),
                    _ => NO_HOST.to_string(),
                }
            }
            _ => NO_HOST.to_string(),
        }
    }
}

/// The full collection of files to process in one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub kind: DatasetKind,
    pub elements: Vec<Element>,
    /// Dataset-wide selection; its size overrides the summed element counts.
    pub selection: Option<Selection>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatasetError {
    #[error("dataset contains no elements")]
    Empty,
    #[error("element {index}: {source}")]
    Element {
        index: usize,
        source: ElementError,
    },
}

impl Dataset {
    pub fn new(kind: DatasetKind) -> Self {
        Self {
            kind,
            elements: Vec::new(),
            selection: None,
        }
    }

    pub fn push(&mut self, element: Element) {
        self.elements.push(element);
    }

    pub fn validate(&self) -> Result<(), DatasetError> {
        if self.elements.is_empty() {
            return Err(DatasetError::Empty);
        }
        for (index, e) in self.elements.iter().enumerate() {
            e.validate()
                .map_err(|source| DatasetError::Element { index, source })?;
        }
        Ok(())
    }
}
