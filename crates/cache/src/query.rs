//! `$select`/`$expand` bookkeeping: merging binding requirements, coverage
//! checks against fetched data and URL rendering.

use std::collections::{BTreeMap, BTreeSet};

/// System query options of one resource.
///
/// `select == None` means all structural properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub select: Option<BTreeSet<String>>,
    pub expand: BTreeMap<String, QueryOptions>,
    pub filter: Option<String>,
    pub orderby: Option<String>,
    pub count: bool,
}

impl QueryOptions {
    /// Options selecting nothing yet; properties are added via `add_path`
    pub fn empty() -> Self {
        Self {
            select: Some(BTreeSet::new()),
            ..Self::default()
        }
    }

    pub fn with_select<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select
            .get_or_insert_with(BTreeSet::new)
            .extend(properties.into_iter().map(Into::into));
        self
    }

    pub fn with_expand(mut self, navigation: &str, options: QueryOptions) -> Self {
        self.expand.insert(navigation.to_string(), options);
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_orderby(mut self, orderby: impl Into<String>) -> Self {
        self.orderby = Some(orderby.into());
        self
    }

    pub fn with_count(mut self) -> Self {
        self.count = true;
        self
    }

    pub fn selects_all(&self) -> bool {
        self.select.is_none()
    }

    /// True if nothing is selected or expanded
    pub fn is_empty(&self) -> bool {
        matches!(&self.select, Some(select) if select.is_empty()) && self.expand.is_empty()
    }

    /// Options that change which rows a collection contains
    pub fn has_row_options(&self) -> bool {
        self.filter.is_some() || self.orderby.is_some() || self.count
    }

    /// Union of `$select`/`$expand`; row options of `self` are kept
    pub fn merge(&mut self, other: &QueryOptions) {
        match (&mut self.select, &other.select) {
            (None, _) => {}
            (select, None) => *select = None,
            (Some(mine), Some(theirs)) => mine.extend(theirs.iter().cloned()),
        }
        for (navigation, options) in &other.expand {
            self.expand
                .entry(navigation.clone())
                .and_modify(|existing| existing.merge(options))
                .or_insert_with(|| options.clone());
        }
    }

    /// Adds a property path such as `SO_2_BP/CompanyName`.
    ///
    /// `is_navigation` receives the relative prefix (`SO_2_BP`) and decides
    /// whether it is expanded or selected as a complex property.
    pub fn add_path(&mut self, path: &str, is_navigation: &dyn Fn(&str) -> bool) {
        self.add_segments(&split(path), "", is_navigation);
    }

    fn add_segments(&mut self, segments: &[&str], base: &str, is_navigation: &dyn Fn(&str) -> bool) {
        let Some((first, rest)) = segments.split_first() else {
            return;
        };
        if *first == "*" {
            self.select = None;
            return;
        }
        let prefix = join(base, first);
        if is_navigation(&prefix) {
            let child = self
                .expand
                .entry(first.to_string())
                .or_insert_with(|| {
                    if rest.is_empty() {
                        QueryOptions::default()
                    } else {
                        QueryOptions::empty()
                    }
                });
            if !rest.is_empty() {
                child.add_segments(rest, &prefix, is_navigation);
            }
        } else if let Some(select) = &mut self.select {
            select.insert(segments.join("/"));
        }
    }

    /// Builds options for exactly the given property paths
    pub fn for_paths(paths: &[String], is_navigation: &dyn Fn(&str) -> bool) -> Self {
        let mut options = QueryOptions::empty();
        for path in paths {
            options.add_path(path, is_navigation);
        }
        options
    }

    /// True if data fetched with these options contains `path`
    pub fn covers(&self, path: &str) -> bool {
        self.covers_segments(&split(path))
    }

    fn covers_segments(&self, segments: &[&str]) -> bool {
        let Some((first, rest)) = segments.split_first() else {
            return true;
        };
        if let Some(child) = self.expand.get(*first) {
            return child.covers_segments(rest);
        }
        match &self.select {
            None => true,
            Some(select) => {
                let full = segments.join("/");
                select.contains("*")
                    || select.contains(*first)
                    || select.contains(&full)
                    || select
                        .iter()
                        .any(|selected| full.starts_with(&format!("{}/", selected)))
            }
        }
    }

    /// Paths of `requested` that are not covered yet
    pub fn missing(&self, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .filter(|path| !self.covers(path))
            .cloned()
            .collect()
    }

    /// The part of these options touched by side-effect paths.
    ///
    /// A path outside the current options contributes nothing; `*` or an empty
    /// path selects everything that is there.
    pub fn intersect(&self, paths: &[String]) -> Option<QueryOptions> {
        let mut result = QueryOptions::empty();
        for path in paths {
            let segments = split(path);
            if segments.is_empty() || segments == ["*"] {
                let mut all = self.clone();
                all.filter = None;
                all.orderby = None;
                all.count = false;
                result.merge(&all);
                continue;
            }
            self.intersect_segments(&segments, &mut result);
        }
        if result.is_empty() { None } else { Some(result) }
    }

    fn intersect_segments(&self, segments: &[&str], result: &mut QueryOptions) {
        let Some((first, rest)) = segments.split_first() else {
            return;
        };
        if let Some(child) = self.expand.get(*first) {
            let target = result
                .expand
                .entry(first.to_string())
                .or_insert_with(QueryOptions::empty);
            if rest.is_empty() || rest == ["*"] {
                target.merge(child);
            } else {
                child.intersect_segments(rest, target);
            }
            return;
        }
        if self.covers_segments(segments) {
            if let Some(select) = &mut result.select {
                select.insert(segments.join("/"));
            }
        }
    }

    /// Makes sure key properties are part of an explicit `$select`
    pub fn ensure_selected(&mut self, properties: &[String]) {
        if let Some(select) = &mut self.select {
            select.extend(properties.iter().cloned());
        }
    }

    /// Top-level rendering: `$count=true&$expand=...&$filter=...&$orderby=...&$select=...`
    pub fn to_query_string(&self) -> String {
        self.render("&")
    }

    fn render(&self, separator: &str) -> String {
        let mut parts = Vec::new();
        if self.count {
            parts.push("$count=true".to_string());
        }
        if !self.expand.is_empty() {
            let expand = self
                .expand
                .iter()
                .map(|(navigation, options)| {
                    let nested = options.render(";");
                    if nested.is_empty() {
                        navigation.clone()
                    } else {
                        format!("{}({})", navigation, nested)
                    }
                })
                .collect::<Vec<_>>()
                .join(",");
            parts.push(format!("$expand={}", expand));
        }
        if let Some(filter) = &self.filter {
            parts.push(format!("$filter={}", filter));
        }
        if let Some(orderby) = &self.orderby {
            parts.push(format!("$orderby={}", orderby));
        }
        if let Some(select) = &self.select {
            if !select.is_empty() {
                parts.push(format!(
                    "$select={}",
                    select.iter().cloned().collect::<Vec<_>>().join(",")
                ));
            }
        }
        parts.join(separator)
    }
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn join(base: &str, segment: &str) -> String {
    if base.is_empty() {
        segment.to_string()
    } else {
        format!("{}/{}", base, segment)
    }
}

/// Appends a query string to a resource URL
pub fn append_query(url: &str, query: &str) -> String {
    if query.is_empty() {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&{}", url, query)
    } else {
        format!("{}?{}", url, query)
    }
}
