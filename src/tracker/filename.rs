//! Filename heuristics for locating books the agent has written to disk.
//!
//! The agent names files by its own convention, so the relay guesses. These
//! functions are pure; the tracker does the filesystem lookups.

/// Ebook extensions tried for every naming template, in lookup order.
pub const EBOOK_EXTENSIONS: [&str; 8] = [
    ".epub", ".pdf", ".mobi", ".txt", ".azw", ".azw3", ".fb2", ".djvu",
];

/// Suffix the agent uses while a transfer is still being written.
pub const TEMP_SUFFIX: &str = ".temp";

/// Maximum sanitized component length in bytes.
const MAX_COMPONENT_LEN: usize = 200;

/// Author used when neither the request nor the book string names one.
pub const UNKNOWN_AUTHOR: &str = "Unknown Author";

/// Builds the ordered list of filenames to look for a book under.
///
/// Templates are tried in this order, each with every extension in
/// [`EBOOK_EXTENSIONS`] and then bare:
/// `Title - Author`, `Title_Author`, `Title by Author`, `Title`, `Title Author`.
/// Templates that need an author are skipped when the author is blank.
///
/// ```
/// use bookrelay::tracker::filename::candidate_names;
///
/// let names = candidate_names("Dune", "Frank Herbert");
/// assert_eq!(names[0], "Dune - Frank Herbert.epub");
/// assert!(names.contains(&"Dune.pdf".to_string()));
/// ```
#[must_use]
pub fn candidate_names(title: &str, author: &str) -> Vec<String> {
    let title = sanitize_filename(title);
    let author = sanitize_filename(author);
    if title.is_empty() {
        return Vec::new();
    }

    let stems: Vec<String> = if author.is_empty() {
        vec![title.clone()]
    } else {
        vec![
            format!("{title} - {author}"),
            format!("{title}_{author}"),
            format!("{title} by {author}"),
            title.clone(),
            format!("{title} {author}"),
        ]
    };

    let mut names = Vec::with_capacity(stems.len() * (EBOOK_EXTENSIONS.len() + 1));
    for stem in stems {
        for ext in EBOOK_EXTENSIONS {
            names.push(format!("{stem}{ext}"));
        }
        names.push(stem);
    }
    names
}

/// Replaces characters that are invalid in filenames and trims the result.
///
/// `/ \ : * ? " < > |` and control characters become `_`; leading and
/// trailing spaces and dots are removed; the result is capped at 200 bytes.
#[must_use]
pub fn sanitize_filename(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == ' ' || c == '.');
    truncate_at_char_boundary(trimmed, MAX_COMPONENT_LEN).to_string()
}

fn truncate_at_char_boundary(value: &str, max_len: usize) -> &str {
    if value.len() <= max_len {
        return value;
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Whether a directory entry must never be treated as a finished book.
#[must_use]
pub fn is_temporary_name(name: &str) -> bool {
    name.starts_with('.') || name.ends_with(TEMP_SUFFIX)
}

/// Splits a `"<title> by <author>"` request string.
///
/// Without a ` by ` separator the whole string is the title and the author is
/// unknown (`None`). A blank side of the separator counts as missing.
#[must_use]
pub fn split_title_author(book: &str) -> (String, Option<String>) {
    let mut parts = book.split(" by ");
    let head = parts.next().unwrap_or_default().trim();
    let Some(author) = parts.next() else {
        return (book.trim().to_string(), None);
    };
    let title = if head.is_empty() { book.trim() } else { head };
    let author = Some(author.trim())
        .filter(|a| !a.is_empty())
        .map(str::to_string);
    (title.to_string(), author)
}

/// Picks the title/author used for the email.
///
/// Structured fields always win; the book string is only parsed for a field
/// the caller left blank.
#[must_use]
pub fn resolve_title_author(
    book: &str,
    title: Option<&str>,
    author: Option<&str>,
) -> (String, String) {
    let title = title.map(str::trim).filter(|t| !t.is_empty());
    let author = author.map(str::trim).filter(|a| !a.is_empty());

    if let (Some(title), Some(author)) = (title, author) {
        return (title.to_string(), author.to_string());
    }

    let (parsed_title, parsed_author) = split_title_author(book);
    (
        title.map_or(parsed_title, str::to_string),
        author
            .map(str::to_string)
            .or(parsed_author)
            .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
    )
}
