//! Paged list requests and responses.

use serde::{Deserialize, Deserializer, Serialize};

use crate::api::request::ApiRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// `page`/`size`/`sort`/`direction` query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
    pub sort: Option<String>,
    pub direction: Option<SortDirection>,
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size,
            sort: None,
            direction: None,
        }
    }

    #[must_use]
    pub fn sorted_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(field.into());
        self.direction = Some(direction);
        self
    }

    /// The request for the following page.
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            page: self.page + 1,
            ..self.clone()
        }
    }

    pub(crate) fn apply(&self, request: ApiRequest) -> ApiRequest {
        let mut request = request.query("page", self.page).query("size", self.size);
        if let Some(sort) = &self.sort {
            request = request.query("sort", sort);
        }
        if let Some(direction) = self.direction {
            request = request.query("direction", direction.as_str());
        }
        request
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, 20)
    }
}

/// One page of results.
///
/// Deserializes from both response shapes the backend uses: the nested
/// `{content, pageable: {...}}` form and the flat
/// `{content, pageNumber, pageSize, totalElements, totalPages, last}` form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    pub page_number: u32,
    pub page_size: u32,
    pub total_elements: u64,
    pub total_pages: u32,
    pub last: bool,
}

impl<T> Page<T> {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn has_next(&self) -> bool {
        !self.last
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            page_number: self.page_number,
            page_size: self.page_size,
            total_elements: self.total_elements,
            total_pages: self.total_pages,
            last: self.last,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageableRepr {
    page_number: u32,
    page_size: u32,
    #[serde(default)]
    total_elements: Option<u64>,
    #[serde(default)]
    total_pages: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PageRepr<T> {
    #[serde(rename_all = "camelCase")]
    Nested {
        content: Vec<T>,
        pageable: PageableRepr,
        #[serde(default)]
        total_elements: Option<u64>,
        #[serde(default)]
        total_pages: Option<u32>,
        #[serde(default)]
        last: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    Flat {
        content: Vec<T>,
        page_number: u32,
        page_size: u32,
        total_elements: u64,
        total_pages: u32,
        #[serde(default)]
        last: Option<bool>,
    },
}

fn is_last(page_number: u32, total_pages: u32) -> bool {
    page_number.saturating_add(1) >= total_pages
}

impl<T> From<PageRepr<T>> for Page<T> {
    fn from(repr: PageRepr<T>) -> Self {
        match repr {
            PageRepr::Nested {
                content,
                pageable,
                total_elements,
                total_pages,
                last,
            } => {
                let total_elements = total_elements
                    .or(pageable.total_elements)
                    .unwrap_or(content.len() as u64);
                let total_pages = total_pages.or(pageable.total_pages).unwrap_or(1);
                Page {
                    last: last.unwrap_or_else(|| is_last(pageable.page_number, total_pages)),
                    content,
                    page_number: pageable.page_number,
                    page_size: pageable.page_size,
                    total_elements,
                    total_pages,
                }
            }
            PageRepr::Flat {
                content,
                page_number,
                page_size,
                total_elements,
                total_pages,
                last,
            } => Page {
                content,
                page_number,
                page_size,
                total_elements,
                total_pages,
                last: last.unwrap_or_else(|| is_last(page_number, total_pages)),
            },
        }
    }
}

impl<'de, T> Deserialize<'de> for Page<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        PageRepr::<T>::deserialize(deserializer).map(Page::from)
    }
}
