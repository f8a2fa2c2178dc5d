//! Turning raw OCR output into track titles.
//!
//! Frames are cropped to the region where a title is displayed, so the OCR
//! output is usually a single title plus some noise from borders and UI
//! chrome. These helpers clean that up and reject near-duplicates of titles we
//! have already seen.

use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;

use crate::{
    ocr::{OcrOpts, recognize_text},
    prelude::*,
    ui::Ui,
};

/// Symbols which show up as OCR noise around titles.
static NOISE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[|={}_\[\]]").expect("failed to compile regex"));

/// Runs of whitespace.
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("failed to compile regex"));

/// Titles shorter than this are rejected.
const MIN_TITLE_CHARS: usize = 4;

/// Titles with a lower share of ASCII letters and digits are rejected.
const MIN_ALPHANUMERIC_RATIO: f32 = 0.5;

/// Titles more similar than this to a known title are duplicates.
const DUPLICATE_SIMILARITY: f32 = 0.7;

/// Clean raw OCR text: drop noisy symbols and normalize whitespace.
pub fn clean_ocr_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let text = text.replace('\n', " ");
    let text = NOISE_RE.replace_all(&text, "");
    WHITESPACE_RE.replace_all(&text, " ").trim().to_owned()
}

/// Does this look like a real title rather than noise?
pub fn is_valid_title(title: &str) -> bool {
    let len = title.chars().count();
    if len < MIN_TITLE_CHARS {
        return false;
    }
    let alphanumeric = title.chars().filter(char::is_ascii_alphanumeric).count();
    alphanumeric as f32 >= len as f32 * MIN_ALPHANUMERIC_RATIO
}

/// Sørensen–Dice similarity of two strings, based on character bigrams.
///
/// Whitespace is ignored. Returns a value between 0.0 (nothing in common) and
/// 1.0 (identical).
pub fn compare_two_strings(first: &str, second: &str) -> f32 {
    let first = first
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<Vec<_>>();
    let second = second
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<Vec<_>>();

    if first == second {
        return 1.0;
    }
    if first.len() < 2 || second.len() < 2 {
        return 0.0;
    }

    let mut first_bigrams: HashMap<(char, char), usize> = HashMap::new();
    for pair in first.windows(2) {
        *first_bigrams.entry((pair[0], pair[1])).or_default() += 1;
    }

    let mut intersection = 0;
    for pair in second.windows(2) {
        if let Some(count) = first_bigrams.get_mut(&(pair[0], pair[1]))
            && *count > 0
        {
            *count -= 1;
            intersection += 1;
        }
    }

    (2 * intersection) as f32 / (first.len() + second.len() - 2) as f32
}

/// Should `new_title` be rejected, either because it isn't a plausible title
/// or because it is a fuzzy match for a title we already have?
pub fn is_duplicate_title<S: AsRef<str>>(new_title: &str, existing_titles: &[S]) -> bool {
    if !is_valid_title(new_title) {
        return true;
    }
    let new_title = new_title.to_lowercase();
    existing_titles.iter().any(|title| {
        compare_two_strings(&new_title, &title.as_ref().to_lowercase())
            > DUPLICATE_SIMILARITY
    })
}

/// Turn raw OCR output into a new title, or `None` if it's empty, noise, or
/// something we've already seen.
pub fn accept_title<S: AsRef<str>>(raw_text: &str, existing_titles: &[S]) -> Option<String> {
    let title = clean_ocr_text(raw_text);
    if title.is_empty() || is_duplicate_title(&title, existing_titles) {
        None
    } else {
        Some(title)
    }
}

/// OCR a frame showing a title, and return the title if it's new.
///
/// Failures are logged and treated as "no title". If `remove_image` is set,
/// the image is deleted once we've read it.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn process_image<S: AsRef<str>>(
    ui: &Ui,
    path: &Path,
    existing_titles: &[S],
    remove_image: bool,
    opts: &OcrOpts,
) -> Option<String> {
    if !path.exists() {
        warn!("Image not found: {}", path.display());
        return None;
    }
    let raw_text = recognize_text(ui, path, opts).await;
    if remove_image && let Err(err) = tokio::fs::remove_file(path).await {
        debug!("Could not remove {}: {}", path.display(), err);
    }
    let title = accept_title(&raw_text, existing_titles);
    match &title {
        Some(title) => info!(title = %title, "Found new title"),
        None => debug!(raw_text = %raw_text, "No new title"),
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_removes_noise_and_collapses_whitespace() {
        assert_eq!(clean_ocr_text(""), "");
        assert_eq!(
            clean_ocr_text("  | Daft Punk =\n  Around_the [World] {} "),
            "Daft Punk Aroundthe World"
        );
        assert_eq!(clean_ocr_text("a\r\nb\tc"), "a b c");
        assert_eq!(clean_ocr_text("=== ___ |||"), "");
    }

    #[test]
    fn short_or_noisy_titles_are_invalid() {
        assert!(!is_valid_title(""));
        assert!(!is_valid_title("abc"));
        assert!(is_valid_title("abcd"));
        assert!(!is_valid_title("a--b--c--d"));
        assert!(is_valid_title("Song (Live)"));
        assert!(!is_valid_title("é è à ù"));
    }

    #[test]
    fn similarity_matches_dice_coefficient() {
        assert_eq!(compare_two_strings("hello", "hello"), 1.0);
        assert_eq!(compare_two_strings("a", "b"), 0.0);
        assert_eq!(compare_two_strings("", ""), 1.0);
        assert_eq!(compare_two_strings("ab", "cd"), 0.0);
        // "night" and "nacht" share only the "ht" bigram.
        assert!((compare_two_strings("night", "nacht") - 0.25).abs() < 1e-6);
        // Whitespace is ignored entirely.
        assert_eq!(compare_two_strings("Get Lucky", "GetLucky"), 1.0);
        // Repeated bigrams are only counted as often as they appear.
        assert!((compare_two_strings("aaaa", "aa") - 0.5).abs() < 1e-6);
    }

    #[test]
    fn near_duplicates_are_detected() {
        let existing = vec!["Get Lucky", "Harder Better Faster"];
        assert!(is_duplicate_title("get lucky", &existing));
        assert!(is_duplicate_title("Get Lucku", &existing));
        assert!(!is_duplicate_title("One More Time", &existing));
        // Invalid titles are always rejected.
        assert!(is_duplicate_title("|_|", &existing));
        assert!(!is_duplicate_title::<&str>("Instant Crush", &[]));
    }

    #[test]
    fn accepted_titles_are_cleaned() {
        let existing = vec!["Get Lucky".to_owned()];
        assert_eq!(
            accept_title("| One More\nTime =", &existing),
            Some("One More Time".to_owned())
        );
        assert_eq!(accept_title("GET LUCKY", &existing), None);
        assert_eq!(accept_title("", &existing), None);
        assert_eq!(accept_title("[_]", &existing), None);
    }

    #[tokio::test]
    async fn missing_images_have_no_title() {
        let ui = Ui::init_for_tests();
        let title = process_image::<&str>(
            &ui,
            Path::new("/nonexistent/frame.png"),
            &[],
            true,
            &OcrOpts::default(),
        )
        .await;
        assert_eq!(title, None);
    }
}
