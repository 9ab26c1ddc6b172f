use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::domain::Post;

/// A search over one or more feeds.
///
/// The cheap parts of a search (first term, first tag, reblog exclusion,
/// pagination cursor) are also pushed down into the storage layer; the full
/// predicate is always re-checked in memory via [`Search::matches`].
#[derive(Debug, Clone, Default)]
pub struct Search {
    pub active: bool,

    /// Pagination cursor: only posts with `id < before_id` are shown.
    ///
    /// Ids are compared as opaque strings, which pages chronologically only
    /// for sources whose ids are uniform-width numeric strings (tumblr).
    pub before_id: String,

    pub no_reblogs: bool,
    /// Elide non-matching posts instead of marking them hidden.
    pub skip: bool,
    pub terms: Vec<String>,
    pub tags: Vec<String>,
    pub exclude_terms: Vec<String>,
    pub exclude_tags: Vec<String>,

    /// Bypass caches and fetch from the upstream.
    pub force_fresh: bool,

    pub(crate) terms_re: Option<Regex>,
    pub(crate) exclude_terms_re: Option<Regex>,
}

impl Search {
    /// True if the post matches the search. An inactive search matches
    /// everything.
    pub fn matches(&self, post: &Post) -> bool {
        if !self.active {
            return true;
        }

        if self.no_reblogs && post.is_reblog() {
            return false;
        }

        for tag in &post.tags {
            let tag = tag.to_lowercase();
            if self.exclude_tags.iter().any(|exclude| *exclude == tag) {
                return false;
            }
        }

        // must match all tags
        for tag in &self.tags {
            if !post.tags.iter().any(|t| t.to_lowercase() == *tag) {
                return false;
            }
        }

        if let Some(re) = &self.terms_re {
            if !re.is_match(&post.title) && !re.is_match(&post.description_html) {
                return false;
            }
        } else {
            for term in &self.terms {
                if !post.title.to_lowercase().contains(term)
                    && !post.description_html.to_lowercase().contains(term)
                {
                    return false;
                }
            }
        }

        if let Some(re) = &self.exclude_terms_re {
            if re.is_match(&post.title) || re.is_match(&post.description_html) {
                return false;
            }
        } else {
            for term in &self.exclude_terms {
                if post.title.to_lowercase().contains(term)
                    || post.description_html.to_lowercase().contains(term)
                {
                    return false;
                }
            }
        }

        true
    }
}

impl std::fmt::Display for Search {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.active {
            return Ok(());
        }

        if self.no_reblogs {
            write!(f, " noreblogs")?;
        }
        for term in &self.terms {
            write!(f, " {term}")?;
        }
        for term in &self.exclude_terms {
            write!(f, " -{term}")?;
        }
        for tag in &self.tags {
            write!(f, " #{tag}")?;
        }
        for tag in &self.exclude_tags {
            write!(f, " -#{tag}")?;
        }
        Ok(())
    }
}

struct RawTerm {
    exclude: bool,
    tag: bool,
    quoted: bool,
    text: String,
}

/// Split a raw search string into terms.
///
/// Terms may be prefixed with `-` (exclude) and `#` (tag), and quoted with
/// `"` or `'` to allow spaces. An unmatched quote stands for itself.
fn tokenize(raw: &str) -> Vec<RawTerm> {
    let chars: Vec<char> = raw.chars().collect();
    let mut terms = Vec::new();

    let mut i = 0;
    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let mut exclude = false;
        if chars[i] == '-' {
            exclude = true;
            i += 1;
        }
        let mut tag = false;
        if i < chars.len() && chars[i] == '#' {
            tag = true;
            i += 1;
        }

        let mut quoted = false;
        let mut text = String::new();
        if i < chars.len() && (chars[i] == '"' || chars[i] == '\'') {
            let quote = chars[i];
            if let Some(close) = chars[i + 1..].iter().position(|&c| c == quote) {
                quoted = true;
                text = chars[i + 1..i + 1 + close].iter().collect();
                i += close + 2;
            } else {
                // unmatched quote stands for itself
                text.push(quote);
                i += 1;
            }
        } else {
            while i < chars.len() && !chars[i].is_whitespace() {
                text.push(chars[i]);
                i += 1;
            }
        }

        if text.is_empty() {
            continue;
        }

        terms.push(RawTerm {
            exclude,
            tag,
            quoted,
            text,
        });
    }

    terms
}

/// Parse the search terms from the given string.
pub fn parse_terms(raw: &str) -> Search {
    let mut search = Search {
        active: true,
        ..Search::default()
    };

    for term in tokenize(raw) {
        if !term.exclude && !term.tag && !term.quoted {
            match term.text.as_str() {
                "noreblog" | "noreblogs" => {
                    search.no_reblogs = true;
                    continue;
                }
                "skip" => {
                    search.skip = true;
                    continue;
                }
                _ => {}
            }
        }

        let mut text = term.text;
        if let Ok(unescaped) = percent_decode_str(&text).decode_utf8() {
            text = unescaped.into_owned();
        }
        let text = text.to_lowercase();

        match (term.exclude, term.tag) {
            (true, true) => search.exclude_tags.push(text),
            (false, true) => search.tags.push(text),
            (true, false) => search.exclude_terms.push(text),
            (false, false) => search.terms.push(text),
        }
    }

    search.terms_re = word_boundary_union(&search.terms);
    search.exclude_terms_re = word_boundary_union(&search.exclude_terms);

    search
}

fn word_boundary_union(terms: &[String]) -> Option<Regex> {
    if terms.is_empty() {
        return None;
    }

    let escaped: Vec<String> = terms.iter().map(|t| regex::escape(t)).collect();
    let pattern = format!(r"(?i)\b({})\b", escaped.join("|"));
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            tracing::warn!("invalid search terms {terms:?}: {err}");
            None
        }
    }
}
